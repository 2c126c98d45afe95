use std::io::Write;

use anyhow::Result;

use crate::catalog::VoiceCatalog;
use crate::completion::{CompletionSession, CompletionStart};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Backspace,
    Enter,
    Tab,
    Escape,
    /// Ctrl+C or Ctrl+D.
    Interrupt,
    Other,
}

/// Blocking source of key presses. `Ok(None)` means the input is exhausted.
pub trait KeySource {
    fn next_key(&mut self) -> Result<Option<Key>>;

    fn begin_line(&mut self) -> Result<()> {
        Ok(())
    }

    fn end_line(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderEffect {
    None,
    Echo(char),
    EraseLast,
    /// Erase `erase` cells and write `line` in their place.
    Redraw { erase: usize, line: String },
    Bell,
    Commit(String),
    Abort,
}

#[derive(Debug, Default)]
enum EditorState {
    #[default]
    Idle,
    Completing(CompletionSession),
}

pub struct LineEditor<'c> {
    catalog: &'c VoiceCatalog,
    buffer: String,
    state: EditorState,
}

impl<'c> LineEditor<'c> {
    pub fn new(catalog: &'c VoiceCatalog) -> Self {
        Self {
            catalog,
            buffer: String::new(),
            state: EditorState::Idle,
        }
    }

    #[cfg(test)]
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    #[cfg(test)]
    pub fn is_completing(&self) -> bool {
        matches!(self.state, EditorState::Completing(_))
    }

    pub fn handle_key(&mut self, key: Key) -> RenderEffect {
        match key {
            Key::Tab => self.complete(),
            Key::Escape => self.revert(),
            Key::Enter => {
                self.state = EditorState::Idle;
                RenderEffect::Commit(std::mem::take(&mut self.buffer))
            }
            Key::Interrupt => {
                self.state = EditorState::Idle;
                self.buffer.clear();
                RenderEffect::Abort
            }
            Key::Backspace => {
                self.state = EditorState::Idle;
                match self.buffer.pop() {
                    Some(_) => RenderEffect::EraseLast,
                    None => RenderEffect::None,
                }
            }
            Key::Char(c) if !c.is_control() => {
                self.state = EditorState::Idle;
                self.buffer.push(c);
                RenderEffect::Echo(c)
            }
            Key::Char(_) | Key::Other => {
                self.state = EditorState::Idle;
                RenderEffect::None
            }
        }
    }

    fn complete(&mut self) -> RenderEffect {
        match std::mem::take(&mut self.state) {
            EditorState::Completing(mut session) => {
                session.advance();
                self.replace_with_candidate(session)
            }
            EditorState::Idle => match CompletionSession::start(&self.buffer, self.catalog) {
                CompletionStart::Started(session) => self.replace_with_candidate(session),
                CompletionStart::NoMatch => RenderEffect::Bell,
                CompletionStart::NotApplicable => RenderEffect::None,
            },
        }
    }

    fn replace_with_candidate(&mut self, session: CompletionSession) -> RenderEffect {
        let line = session.line();
        let effect = self.replace_buffer(line);
        self.state = EditorState::Completing(session);
        effect
    }

    fn revert(&mut self) -> RenderEffect {
        match std::mem::take(&mut self.state) {
            EditorState::Completing(session) => self.replace_buffer(session.snapshot().to_string()),
            EditorState::Idle => RenderEffect::None,
        }
    }

    fn replace_buffer(&mut self, line: String) -> RenderEffect {
        let erase = self.buffer.chars().count();
        self.buffer = line.clone();
        RenderEffect::Redraw { erase, line }
    }
}

pub fn render<W: Write>(out: &mut W, effect: &RenderEffect) -> Result<()> {
    match effect {
        RenderEffect::None => return Ok(()),
        RenderEffect::Echo(c) => write!(out, "{c}")?,
        RenderEffect::EraseLast => out.write_all(b"\x08 \x08")?,
        RenderEffect::Redraw { erase, line } => {
            let back = "\x08".repeat(*erase);
            write!(out, "{back}{}{back}{line}", " ".repeat(*erase))?;
        }
        RenderEffect::Bell => out.write_all(b"\x07")?,
        RenderEffect::Commit(_) | RenderEffect::Abort => out.write_all(b"\r\n")?,
    }
    out.flush()?;
    Ok(())
}

/// Reads one line from `keys`, echoing edits to `out`. Returns `None` when the
/// user aborts or the key source runs dry.
pub fn read_line<K, W>(keys: &mut K, out: &mut W, catalog: &VoiceCatalog) -> Result<Option<String>>
where
    K: KeySource + ?Sized,
    W: Write,
{
    keys.begin_line()?;
    let result = drive(keys, out, catalog);
    keys.end_line()?;
    result
}

fn drive<K, W>(keys: &mut K, out: &mut W, catalog: &VoiceCatalog) -> Result<Option<String>>
where
    K: KeySource + ?Sized,
    W: Write,
{
    let mut editor = LineEditor::new(catalog);
    while let Some(key) = keys.next_key()? {
        let effect = editor.handle_key(key);
        render(out, &effect)?;
        match effect {
            RenderEffect::Commit(line) => return Ok(Some(line)),
            RenderEffect::Abort => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

#[derive(Debug, Default)]
pub struct ScriptedKeys {
    keys: std::collections::VecDeque<Key>,
}

impl ScriptedKeys {
    #[cfg(test)]
    pub fn new(keys: impl IntoIterator<Item = Key>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    /// Keys for typing `text` followed by Enter. A tab character presses Tab.
    pub fn typed_line(text: &str) -> impl Iterator<Item = Key> + '_ {
        text.chars()
            .map(|ch| if ch == '\t' { Key::Tab } else { Key::Char(ch) })
            .chain(std::iter::once(Key::Enter))
    }

    pub fn push_line(&mut self, text: &str) {
        self.keys.extend(Self::typed_line(text));
    }
}

impl KeySource for ScriptedKeys {
    fn next_key(&mut self) -> Result<Option<Key>> {
        Ok(self.keys.pop_front())
    }
}
