use std::io::{self, BufRead, IsTerminal};

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;

use crate::editor::{Key, KeySource, ScriptedKeys};

/// Reads keys from the terminal in raw mode. Raw mode is only held while a
/// line is being edited so regular output keeps its newline handling.
#[derive(Debug, Default)]
pub struct RawTerminalKeys {
    raw: bool,
}

impl RawTerminalKeys {
    fn restore(&mut self) {
        if self.raw {
            if let Err(err) = terminal::disable_raw_mode() {
                tracing::warn!(%err, "failed to leave raw terminal mode");
            }
            self.raw = false;
        }
    }
}

impl KeySource for RawTerminalKeys {
    fn begin_line(&mut self) -> Result<()> {
        terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
        self.raw = true;
        Ok(())
    }

    fn end_line(&mut self) -> Result<()> {
        self.restore();
        Ok(())
    }

    fn next_key(&mut self) -> Result<Option<Key>> {
        loop {
            match event::read().context("failed reading terminal event")? {
                Event::Key(key) if key.kind != KeyEventKind::Release => {
                    return Ok(Some(map_key(key)));
                }
                _ => {}
            }
        }
    }
}

impl Drop for RawTerminalKeys {
    fn drop(&mut self) {
        self.restore();
    }
}

pub fn map_key(key: KeyEvent) -> Key {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    match key.code {
        KeyCode::Char('c' | 'd') if ctrl => Key::Interrupt,
        KeyCode::Char(_) if ctrl || key.modifiers.contains(KeyModifiers::ALT) => Key::Other,
        KeyCode::Char(c) => Key::Char(c),
        KeyCode::Backspace => Key::Backspace,
        KeyCode::Enter => Key::Enter,
        KeyCode::Tab => Key::Tab,
        KeyCode::Esc => Key::Escape,
        _ => Key::Other,
    }
}

/// Line-buffered fallback for piped input: each line is replayed as typed
/// characters followed by Enter.
#[derive(Debug)]
pub struct LineInputKeys<R> {
    reader: R,
    pending: ScriptedKeys,
}

impl<R: BufRead> LineInputKeys<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: ScriptedKeys::default(),
        }
    }
}

impl<R: BufRead> KeySource for LineInputKeys<R> {
    fn next_key(&mut self) -> Result<Option<Key>> {
        loop {
            if let Some(key) = self.pending.next_key()? {
                return Ok(Some(key));
            }
            let mut line = String::new();
            let read = self
                .reader
                .read_line(&mut line)
                .context("failed reading from stdin")?;
            if read == 0 {
                return Ok(None);
            }
            self.pending.push_line(line.trim_end_matches(['\r', '\n']));
        }
    }
}

/// Picks raw keystrokes when stdin is a terminal, line input otherwise.
pub fn stdin_key_source() -> Box<dyn KeySource> {
    if io::stdin().is_terminal() {
        Box::new(RawTerminalKeys::default())
    } else {
        tracing::debug!("stdin is not a terminal; reading whole lines");
        Box::new(LineInputKeys::new(io::stdin().lock()))
    }
}
