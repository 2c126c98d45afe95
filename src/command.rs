use crate::error::ConsoleError;

pub const VOICE_USAGE: &str = "Example: voice af_heart";
pub const VOICES_USAGE: &str = "Usage: 'voices' or 'voices <prefix>' (e.g. voices bf_)";
pub const SEARCH_USAGE: &str = "Example: search english";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Exit,
    Help,
    Speak(String),
    SwitchVoice(String),
    ListVoices(Option<String>),
    Search(String),
    Wav(WavToggle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WavToggle {
    On,
    Off,
    Status,
}

impl Command {
    /// Parses a line. Keywords are matched case-insensitively on the first
    /// word; text that starts with no keyword is spoken verbatim.
    pub fn parse(line: &str) -> Result<Self, ConsoleError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }

        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (line, ""),
        };
        let keyword = keyword.to_ascii_lowercase();

        match (keyword.as_str(), rest.is_empty()) {
            ("exit" | "quit" | "help", false) => Ok(Self::Speak(line.to_string())),
            ("exit" | "quit", true) => Ok(Self::Exit),
            ("help", true) => Ok(Self::Help),
            ("voice", true) => Err(ConsoleError::validation(
                "Please specify a voice name.",
                VOICE_USAGE,
            )),
            ("voice", false) => Ok(Self::SwitchVoice(rest.to_string())),
            ("voices", true) => Ok(Self::ListVoices(None)),
            ("voices", false) => {
                if rest.split_whitespace().count() > 1 {
                    return Err(ConsoleError::validation(
                        "Invalid voices command format.",
                        VOICES_USAGE,
                    ));
                }
                Ok(Self::ListVoices(Some(rest.to_string())))
            }
            ("search", true) => Err(ConsoleError::validation(
                "Please specify a search term.",
                SEARCH_USAGE,
            )),
            ("search", false) => Ok(Self::Search(rest.to_string())),
            ("wav", _) => Ok(parse_wav(rest).map_or_else(|| Self::Speak(line.to_string()), Self::Wav)),
            _ => Ok(Self::Speak(line.to_string())),
        }
    }
}

fn parse_wav(arg: &str) -> Option<WavToggle> {
    match arg.to_ascii_lowercase().as_str() {
        "on" => Some(WavToggle::On),
        "off" => Some(WavToggle::Off),
        "" | "status" => Some(WavToggle::Status),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn parse(line: &str) -> Command {
        Command::parse(line).unwrap()
    }

    fn parse_err(line: &str) -> ConsoleError {
        Command::parse(line).unwrap_err()
    }

    #[test]
    fn empty_and_whitespace_lines() {
        assert_eq!(parse(""), Command::Empty);
        assert_eq!(parse("   \t "), Command::Empty);
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_eq!(parse("EXIT"), Command::Exit);
        assert_eq!(parse("Quit"), Command::Exit);
        assert_eq!(parse("HeLp"), Command::Help);
        assert_eq!(parse("VOICE bm_lewis"), Command::SwitchVoice("bm_lewis".to_string()));
        assert_eq!(parse("Voices"), Command::ListVoices(None));
    }

    #[test]
    fn voice_argument_is_trimmed_but_case_preserved() {
        assert_eq!(parse("voice   BM_Lewis  "), Command::SwitchVoice("BM_Lewis".to_string()));
    }

    #[test]
    fn missing_voice_name_is_a_validation_error() {
        assert_eq!(parse_err("voice").kind(), ErrorKind::Validation);
        assert_eq!(parse_err("voice    ").kind(), ErrorKind::Validation);
    }

    #[test]
    fn voices_prefix_and_format_errors() {
        assert_eq!(parse("voices bf_"), Command::ListVoices(Some("bf_".to_string())));
        let err = parse_err("voices bf_ am_");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.to_string(), "Invalid voices command format.");
    }

    #[test]
    fn search_requires_a_term() {
        assert_eq!(parse("search british english"), Command::Search("british english".to_string()));
        assert_eq!(parse_err("search").kind(), ErrorKind::Validation);
    }

    #[test]
    fn wav_toggle_group() {
        assert_eq!(parse("wav on"), Command::Wav(WavToggle::On));
        assert_eq!(parse("WAV OFF"), Command::Wav(WavToggle::Off));
        assert_eq!(parse("wav status"), Command::Wav(WavToggle::Status));
        assert_eq!(parse("wav"), Command::Wav(WavToggle::Status));
    }

    #[test]
    fn anything_else_is_spoken() {
        assert_eq!(parse("  hello there "), Command::Speak("hello there".to_string()));
        assert_eq!(parse("voiceover is fun"), Command::Speak("voiceover is fun".to_string()));
        assert_eq!(parse("exit the building"), Command::Speak("exit the building".to_string()));
        assert_eq!(parse("helpful"), Command::Speak("helpful".to_string()));
        assert_eq!(parse("wav files are large"), Command::Speak("wav files are large".to_string()));
        assert_eq!(parse("WAV loud"), Command::Speak("WAV loud".to_string()));
    }
}
