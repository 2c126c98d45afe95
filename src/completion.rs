use crate::catalog::VoiceCatalog;

pub const VOICE_KEYWORD: &str = "voice ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSession {
    snapshot: String,
    candidates: Vec<String>,
    index: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CompletionStart {
    NotApplicable,
    NoMatch,
    Started(CompletionSession),
}

impl CompletionSession {
    /// Starts a session for `buffer`, which becomes the Escape snapshot.
    pub fn start(buffer: &str, catalog: &VoiceCatalog) -> CompletionStart {
        let Some(prefix) = strip_voice_keyword(buffer) else {
            return CompletionStart::NotApplicable;
        };
        let candidates = voice_completions(catalog, prefix);
        if candidates.is_empty() {
            return CompletionStart::NoMatch;
        }
        CompletionStart::Started(Self {
            snapshot: buffer.to_string(),
            candidates,
            index: 0,
        })
    }

    pub fn advance(&mut self) {
        self.index = (self.index + 1) % self.candidates.len();
    }

    pub fn current(&self) -> &str {
        &self.candidates[self.index]
    }

    pub fn line(&self) -> String {
        format!("{VOICE_KEYWORD}{}", self.current())
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    #[cfg(test)]
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Text after a case-insensitive `voice ` keyword, if present.
pub fn strip_voice_keyword(buffer: &str) -> Option<&str> {
    let head = buffer.get(..VOICE_KEYWORD.len())?;
    head.eq_ignore_ascii_case(VOICE_KEYWORD)
        .then(|| &buffer[VOICE_KEYWORD.len()..])
}

/// Catalog names whose lowercase form starts with the lowercase `prefix`,
/// sorted case-insensitively. The sort is stable, so names that compare equal
/// keep catalog order.
pub fn voice_completions(catalog: &VoiceCatalog, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = catalog
        .with_prefix(prefix)
        .into_iter()
        .map(|record| record.name.clone())
        .collect();
    names.sort_by_cached_key(|name| name.to_lowercase());
    names
}
