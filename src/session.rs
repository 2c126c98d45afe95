use std::io::Write;

use anyhow::Result;

use crate::catalog::{VoiceCatalog, VoiceRecord, sort_for_display};
use crate::command::{Command, WavToggle};
use crate::editor::{KeySource, read_line};
use crate::engine::SynthesisEngine;
use crate::error::ConsoleError;
use crate::ranking::{did_you_mean, find_similar};

const SUGGESTION_LIMIT: usize = 3;
const FALLBACK_LISTING: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSettings {
    pub wav_output: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Silent,
    Goodbye,
    Help,
    Switched(VoiceRecord),
    Voices {
        prefix: Option<String>,
        voices: Vec<VoiceRecord>,
    },
    Found {
        term: String,
        voices: Vec<VoiceRecord>,
    },
    Wav {
        enabled: bool,
        changed: bool,
    },
    Spoken,
}

pub struct Session<'a, E: ?Sized, W> {
    catalog: &'a VoiceCatalog,
    engine: &'a mut E,
    active: VoiceRecord,
    settings: SessionSettings,
    out: W,
}

impl<'a, E, W> Session<'a, E, W>
where
    E: SynthesisEngine + ?Sized,
    W: Write,
{
    pub fn new(
        catalog: &'a VoiceCatalog,
        engine: &'a mut E,
        active: VoiceRecord,
        settings: SessionSettings,
        out: W,
    ) -> Self {
        Self {
            catalog,
            engine,
            active,
            settings,
            out,
        }
    }

    pub fn active_voice(&self) -> &VoiceRecord {
        &self.active
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    #[cfg(test)]
    pub fn into_output(self) -> W {
        self.out
    }

    pub fn greet(&mut self) -> Result<()> {
        writeln!(
            self.out,
            "Using voice: {} ({})",
            self.active.name, self.active.language
        )?;
        writeln!(
            self.out,
            "Type 'help' for available commands or just start typing to speak text."
        )?;
        Ok(())
    }

    /// Prompts and executes lines until `exit`, an interrupt, or the end of
    /// the key stream.
    pub fn run<K: KeySource + ?Sized>(&mut self, keys: &mut K) -> Result<()> {
        loop {
            self.prompt()?;
            let Some(line) = read_line(keys, &mut self.out, self.catalog)? else {
                writeln!(self.out, "Goodbye!")?;
                return Ok(());
            };
            if self.execute(&line)? == Reply::Goodbye {
                return Ok(());
            }
        }
    }

    fn prompt(&mut self) -> Result<()> {
        if self.settings.wav_output {
            write!(self.out, "[wav] > ")?;
        } else {
            write!(self.out, "> ")?;
        }
        self.out.flush()?;
        Ok(())
    }

    /// Parses, dispatches and reports one line. Console errors are printed
    /// and swallowed; only output failures are returned.
    pub fn execute(&mut self, line: &str) -> Result<Reply> {
        match Command::parse(line).and_then(|command| self.dispatch(command)) {
            Ok(reply) => {
                self.present(&reply)?;
                Ok(reply)
            }
            Err(err) => {
                tracing::debug!(kind = ?err.kind(), %err, "command failed");
                self.report(&err)?;
                Ok(Reply::Silent)
            }
        }
    }

    pub fn dispatch(&mut self, command: Command) -> Result<Reply, ConsoleError> {
        match command {
            Command::Empty => Ok(Reply::Silent),
            Command::Exit => Ok(Reply::Goodbye),
            Command::Help => Ok(Reply::Help),
            Command::SwitchVoice(name) => self.switch_voice(&name),
            Command::ListVoices(prefix) => self.list_voices(prefix),
            Command::Search(term) => self.search(term),
            Command::Wav(toggle) => Ok(self.toggle_wav(toggle)),
            Command::Speak(text) => {
                self.engine
                    .speak(&text, &self.active)
                    .map_err(ConsoleError::Engine)?;
                Ok(Reply::Spoken)
            }
        }
    }

    fn switch_voice(&mut self, name: &str) -> Result<Reply, ConsoleError> {
        if let Some(voice) = self.catalog.lookup(name) {
            self.active = voice.clone();
            tracing::info!(voice = %voice.name, "switched voice");
            return Ok(Reply::Switched(voice.clone()));
        }

        let suggestions = did_you_mean(self.catalog, name, SUGGESTION_LIMIT);
        let (listing, remaining) = if suggestions.is_empty() {
            let listing: Vec<VoiceRecord> =
                self.catalog.records().iter().take(FALLBACK_LISTING).cloned().collect();
            (listing, self.catalog.len().saturating_sub(FALLBACK_LISTING))
        } else {
            (Vec::new(), 0)
        };
        Err(ConsoleError::VoiceNotFound {
            requested: name.to_string(),
            suggestions: suggestions.into_iter().cloned().collect(),
            listing,
            remaining,
        })
    }

    fn list_voices(&self, prefix: Option<String>) -> Result<Reply, ConsoleError> {
        let voices = match &prefix {
            None => self.catalog.sorted_for_display(),
            Some(prefix) => {
                let matching = self.catalog.with_prefix(prefix);
                if matching.is_empty() {
                    return Err(ConsoleError::no_match(
                        format!("No voices found starting with '{prefix}'."),
                        "Try a different prefix or type 'voices' to see all available voices.",
                    ));
                }
                sort_for_display(matching)
            }
        };
        Ok(Reply::Voices {
            prefix,
            voices: voices.into_iter().cloned().collect(),
        })
    }

    fn search(&self, term: String) -> Result<Reply, ConsoleError> {
        let voices: Vec<VoiceRecord> = find_similar(self.catalog, &term).into_iter().cloned().collect();
        if voices.is_empty() {
            return Err(ConsoleError::no_match(
                format!("No voices found matching '{term}'."),
                "Try a different search term or type 'voices' to see all available voices.",
            ));
        }
        Ok(Reply::Found { term, voices })
    }

    fn toggle_wav(&mut self, toggle: WavToggle) -> Reply {
        let before = self.settings.wav_output;
        match toggle {
            WavToggle::On => self.settings.wav_output = true,
            WavToggle::Off => self.settings.wav_output = false,
            WavToggle::Status => {}
        }
        Reply::Wav {
            enabled: self.settings.wav_output,
            changed: before != self.settings.wav_output,
        }
    }

    fn present(&mut self, reply: &Reply) -> Result<()> {
        let out = &mut self.out;
        match reply {
            Reply::Silent | Reply::Spoken => {}
            Reply::Goodbye => writeln!(out, "Goodbye!")?,
            Reply::Help => out.write_all(HELP.as_bytes())?,
            Reply::Switched(voice) => {
                writeln!(out, "Switched to voice: {} ({})", voice.name, voice.language)?;
                writeln!(out)?;
            }
            Reply::Voices { prefix, voices } => {
                match prefix {
                    Some(prefix) => writeln!(
                        out,
                        "\nVoices starting with '{prefix}' ({} found):",
                        voices.len()
                    )?,
                    None if voices.is_empty() => writeln!(out, "No voices available.")?,
                    None => writeln!(out, "\nAvailable voices:")?,
                }
                write_voice_list(out, voices)?;
                writeln!(out)?;
            }
            Reply::Found { term, voices } => {
                writeln!(out, "Found {} voice(s) matching '{term}':", voices.len())?;
                write_voice_list(out, voices)?;
                writeln!(out)?;
                writeln!(out, "To use a voice, type: voice <exact_name>")?;
            }
            Reply::Wav { enabled, changed } => {
                let state = if *enabled { "on" } else { "off" };
                if *changed {
                    writeln!(out, "WAV output indicator turned {state}.")?;
                } else {
                    writeln!(out, "WAV output indicator is {state}.")?;
                }
                writeln!(
                    out,
                    "Note: saving audio to files is not implemented; speech is played directly."
                )?;
            }
        }
        out.flush()?;
        Ok(())
    }

    fn report(&mut self, err: &ConsoleError) -> Result<()> {
        let out = &mut self.out;
        match err {
            ConsoleError::Validation { message, usage } => {
                writeln!(out, "Error: {message}")?;
                writeln!(out, "{usage}")?;
            }
            ConsoleError::VoiceNotFound {
                requested,
                suggestions,
                listing,
                remaining,
            } => {
                writeln!(out, "Voice '{requested}' not found.")?;
                if !suggestions.is_empty() {
                    writeln!(out, "Did you mean one of these?")?;
                    write_voice_list(out, suggestions)?;
                } else if !listing.is_empty() {
                    writeln!(out, "Available voices:")?;
                    write_voice_list(out, listing)?;
                    if *remaining > 0 {
                        writeln!(
                            out,
                            "  ... and {remaining} more (type 'voices' to see all)"
                        )?;
                    }
                }
                writeln!(
                    out,
                    "Tip: voice names are case-sensitive. Use Tab after 'voice ' to complete them, \
                     or 'voices <prefix>' to filter."
                )?;
            }
            ConsoleError::NoMatch { message, hint } => {
                writeln!(out, "{message}")?;
                writeln!(out, "{hint}")?;
            }
            ConsoleError::Engine(source) => writeln!(out, "Error speaking text: {source:#}")?,
        }
        out.flush()?;
        Ok(())
    }
}

fn write_voice_list<W: Write>(out: &mut W, voices: &[VoiceRecord]) -> Result<()> {
    for voice in voices {
        writeln!(out, "  - {} ({})", voice.name, voice.language)?;
    }
    Ok(())
}

/// Initial voice: the requested one if the catalog has it, otherwise the first
/// catalog entry with a warning. `None` only for an empty catalog.
pub fn initial_voice<W: Write>(
    catalog: &VoiceCatalog,
    requested: Option<&str>,
    out: &mut W,
) -> Result<Option<VoiceRecord>> {
    if let Some(voice) = requested.and_then(|name| catalog.lookup(name)) {
        return Ok(Some(voice.clone()));
    }
    let Some(first) = catalog.first() else {
        return Ok(None);
    };
    if let Some(requested) = requested {
        writeln!(
            out,
            "Warning: voice '{requested}' not found. Using '{}' instead.",
            first.name
        )?;
    }
    Ok(Some(first.clone()))
}

pub const HELP: &str = "
Commands:
  - Type text to speak it
  - 'voice <name>'     Change voice (exact name required, Tab for completion)
  - 'voices'           List all available voices
  - 'voices <prefix>'  List voices starting with prefix (e.g. 'voices bf_')
  - 'search <term>'    Search for voices by name or language
  - 'wav on|off|status' Toggle the WAV output indicator (display only)
  - 'help'             Show this help
  - 'exit' or 'quit'   Exit the program

Tip: use Tab after 'voice ' to auto-complete voice names, Esc to undo the completion.

";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::{Key, ScriptedKeys};
    use crate::error::ErrorKind;
    use anyhow::anyhow;

    #[derive(Default)]
    struct FakeEngine {
        spoken: Vec<(String, String)>,
        fail: bool,
    }

    impl SynthesisEngine for FakeEngine {
        fn speak(&mut self, text: &str, voice: &VoiceRecord) -> Result<()> {
            if self.fail {
                return Err(anyhow!("audio device unavailable"));
            }
            self.spoken.push((text.to_string(), voice.name.clone()));
            Ok(())
        }
    }

    fn catalog() -> VoiceCatalog {
        VoiceCatalog::new([
            VoiceRecord::new("af_heart", "en"),
            VoiceRecord::new("bf_bella", "en"),
            VoiceRecord::new("bm_lewis", "en"),
        ])
    }

    fn names(voices: &[VoiceRecord]) -> Vec<&str> {
        voices.iter().map(|v| v.name.as_str()).collect()
    }

    fn session<'a>(
        catalog: &'a VoiceCatalog,
        engine: &'a mut FakeEngine,
    ) -> Session<'a, FakeEngine, Vec<u8>> {
        let active = catalog.first().cloned().unwrap();
        Session::new(catalog, engine, active, SessionSettings::default(), Vec::new())
    }

    fn output(session: Session<'_, FakeEngine, Vec<u8>>) -> String {
        String::from_utf8(session.into_output()).unwrap()
    }

    #[test]
    fn switching_to_an_exact_name() {
        let catalog = catalog();
        let mut engine = FakeEngine::default();
        let mut session = session(&catalog, &mut engine);
        let reply = session.dispatch(Command::SwitchVoice("bm_lewis".into())).unwrap();
        assert_eq!(reply, Reply::Switched(VoiceRecord::new("bm_lewis", "en")));
        assert_eq!(session.active_voice().name, "bm_lewis");
    }

    #[test]
    fn near_miss_suggests_and_keeps_voice() {
        let catalog = catalog();
        let mut engine = FakeEngine::default();
        let mut session = session(&catalog, &mut engine);
        let err = session
            .dispatch(Command::SwitchVoice("bm_lewi".into()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lookup);
        let ConsoleError::VoiceNotFound { suggestions, listing, .. } = err else {
            panic!("expected VoiceNotFound");
        };
        assert_eq!(names(&suggestions)[0], "bm_lewis");
        assert!(listing.is_empty());
        assert_eq!(session.active_voice().name, "af_heart");
    }

    #[test]
    fn hopeless_name_falls_back_to_a_listing() {
        let catalog = VoiceCatalog::from_names([
            "af_alloy", "af_aoede", "af_bella", "af_heart", "af_jessica", "af_kore", "af_nicole",
        ]);
        let mut engine = FakeEngine::default();
        let active = catalog.first().cloned().unwrap();
        let mut session = Session::new(&catalog, &mut engine, active, SessionSettings::default(), Vec::new());
        session.execute("voice xyzzy_qwerty").unwrap();
        let out = String::from_utf8(session.into_output()).unwrap();
        assert!(out.contains("Voice 'xyzzy_qwerty' not found."));
        assert!(out.contains("Available voices:"));
        assert!(out.contains("  - af_jessica (en-us)"));
        assert!(!out.contains("af_kore"));
        assert!(out.contains("... and 2 more"));
    }

    #[test]
    fn empty_voice_name_leaves_active_voice() {
        let catalog = catalog();
        let mut engine = FakeEngine::default();
        let mut session = session(&catalog, &mut engine);
        assert_eq!(session.execute("voice ").unwrap(), Reply::Silent);
        assert_eq!(session.active_voice().name, "af_heart");
        assert!(output(session).starts_with("Error: Please specify a voice name."));
    }

    #[test]
    fn voices_prefix_lists_only_matches() {
        let catalog = catalog();
        let mut engine = FakeEngine::default();
        let mut session = session(&catalog, &mut engine);
        let Reply::Voices { voices, .. } = session.execute("voices bf_").unwrap() else {
            panic!("expected a listing");
        };
        assert_eq!(names(&voices), vec!["bf_bella"]);
        assert!(output(session).contains("Voices starting with 'bf_' (1 found):"));
    }

    #[test]
    fn voices_prefix_is_sorted_by_language_then_name() {
        let catalog = VoiceCatalog::new([
            VoiceRecord::new("af_heart", "en-us"),
            VoiceRecord::new("vz_beta", "fr-fr"),
            VoiceRecord::new("vb_amy", "en-us"),
            VoiceRecord::new("VA_zed", "en-us"),
            VoiceRecord::new("vc_rosa", "es"),
        ]);
        let mut engine = FakeEngine::default();
        let mut session = session(&catalog, &mut engine);
        let Reply::Voices { voices, .. } = session.execute("voices v").unwrap() else {
            panic!("expected a listing");
        };
        assert_eq!(names(&voices), vec!["VA_zed", "vb_amy", "vc_rosa", "vz_beta"]);
        assert!(output(session).contains(
            "Voices starting with 'v' (4 found):\n  - VA_zed (en-us)\n  - vb_amy (en-us)\n  - vc_rosa (es)\n  - vz_beta (fr-fr)\n"
        ));
    }

    #[test]
    fn voices_prefix_without_match_is_reported() {
        let catalog = catalog();
        let mut engine = FakeEngine::default();
        let mut session = session(&catalog, &mut engine);
        let err = session
            .dispatch(Command::ListVoices(Some("zz".into())))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lookup);
    }

    #[test]
    fn full_listing_is_sorted_by_language_then_name() {
        let catalog = VoiceCatalog::new([
            VoiceRecord::new("bm_lewis", "en-gb"),
            VoiceRecord::new("zf_xiaobei", "cmn"),
            VoiceRecord::new("af_heart", "en-us"),
            VoiceRecord::new("bf_alice", "en-gb"),
        ]);
        let mut engine = FakeEngine::default();
        let mut session = session(&catalog, &mut engine);
        let Reply::Voices { voices, .. } = session.dispatch(Command::ListVoices(None)).unwrap() else {
            panic!("expected a listing");
        };
        assert_eq!(names(&voices), vec!["zf_xiaobei", "bf_alice", "bm_lewis", "af_heart"]);
    }

    #[test]
    fn search_matches_language_and_reports_misses() {
        let catalog = catalog();
        let mut engine = FakeEngine::default();
        let mut session = session(&catalog, &mut engine);
        let Reply::Found { voices, .. } = session.dispatch(Command::Search("en".into())).unwrap() else {
            panic!("expected search results");
        };
        assert_eq!(names(&voices), vec!["af_heart", "bf_bella", "bm_lewis"]);
        let err = session.dispatch(Command::Search("klingon".into())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lookup);
    }

    #[test]
    fn speak_uses_active_voice_and_reports_engine_failures() {
        let catalog = catalog();
        let mut engine = FakeEngine::default();
        {
            let mut session = session(&catalog, &mut engine);
            session.execute("voice bf_bella").unwrap();
            assert_eq!(session.execute("Hello there").unwrap(), Reply::Spoken);
        }
        assert_eq!(engine.spoken, vec![("Hello there".to_string(), "bf_bella".to_string())]);

        engine.fail = true;
        let mut session = session(&catalog, &mut engine);
        assert_eq!(session.execute("Hello again").unwrap(), Reply::Silent);
        assert!(output(session).contains("Error speaking text: audio device unavailable"));
    }

    #[test]
    fn wav_toggle_only_changes_the_indicator() {
        let catalog = catalog();
        let mut engine = FakeEngine::default();
        let mut session = session(&catalog, &mut engine);
        assert_eq!(
            session.execute("wav on").unwrap(),
            Reply::Wav { enabled: true, changed: true }
        );
        assert!(session.settings().wav_output);
        assert_eq!(
            session.execute("wav on").unwrap(),
            Reply::Wav { enabled: true, changed: false }
        );
        assert_eq!(
            session.execute("wav off").unwrap(),
            Reply::Wav { enabled: false, changed: true }
        );
        assert!(!session.settings().wav_output);
    }

    #[test]
    fn run_loop_end_to_end() {
        let catalog = catalog();
        let mut engine = FakeEngine::default();
        let mut keys = ScriptedKeys::default();
        keys.push_line("");
        keys.push_line("voice bm_lewi");
        keys.push_line("voice bm_lewis");
        keys.push_line("say hi");
        keys.push_line("search en");
        keys.push_line("quit");
        keys.push_line("never reached");
        let out = {
            let mut session = session(&catalog, &mut engine);
            session.run(&mut keys).unwrap();
            assert_eq!(session.active_voice().name, "bm_lewis");
            output(session)
        };
        assert_eq!(engine.spoken, vec![("say hi".to_string(), "bm_lewis".to_string())]);
        assert!(out.starts_with("> \r\n> "));
        assert!(out.contains("Did you mean one of these?\n  - bm_lewis (en)\n"));
        assert!(out.contains("Switched to voice: bm_lewis (en)"));
        assert!(out.contains("Found 3 voice(s) matching 'en':"));
        assert!(out.ends_with("Goodbye!\n"));
    }

    #[test]
    fn run_loop_completes_with_tab() {
        let catalog = catalog();
        let mut engine = FakeEngine::default();
        let mut keys = ScriptedKeys::new(
            "voice b"
                .chars()
                .map(Key::Char)
                .chain([Key::Tab, Key::Tab, Key::Enter, Key::Interrupt]),
        );
        let mut session = session(&catalog, &mut engine);
        session.run(&mut keys).unwrap();
        assert_eq!(session.active_voice().name, "bm_lewis");
    }

    #[test]
    fn initial_voice_prefers_request_then_first_entry() {
        let catalog = catalog();
        let mut out = Vec::new();
        let voice = initial_voice(&catalog, Some("bm_lewis"), &mut out).unwrap();
        assert_eq!(voice.unwrap().name, "bm_lewis");
        assert!(out.is_empty());

        let voice = initial_voice(&catalog, Some("nobody"), &mut out).unwrap();
        assert_eq!(voice.unwrap().name, "af_heart");
        assert!(String::from_utf8(out).unwrap().contains("voice 'nobody' not found"));

        let empty = VoiceCatalog::default();
        assert!(initial_voice(&empty, None, &mut Vec::new()).unwrap().is_none());
    }
}
