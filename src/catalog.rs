use std::collections::HashSet;

pub const DEFAULT_LANGUAGE: &str = "en-us";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceRecord {
    pub name: String,
    pub language: String,
}

impl VoiceRecord {
    pub fn new(name: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            language: language.into(),
        }
    }
}

/// Ordered set of voices. Order is insertion order and is what "first N"
/// listings and ranking tie-breaks refer to.
#[derive(Debug, Clone, Default)]
pub struct VoiceCatalog {
    records: Vec<VoiceRecord>,
}

impl VoiceCatalog {
    pub fn new(records: impl IntoIterator<Item = VoiceRecord>) -> Self {
        let mut seen = HashSet::new();
        let records = records
            .into_iter()
            .filter(|record| seen.insert(record.name.clone()))
            .collect();
        Self { records }
    }

    #[cfg(test)]
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names.into_iter().map(|name| {
            let name = name.into();
            let language = language_for_voice(&name);
            VoiceRecord { name, language }
        }))
    }

    pub fn records(&self) -> &[VoiceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first(&self) -> Option<&VoiceRecord> {
        self.records.first()
    }

    pub fn lookup(&self, name: &str) -> Option<&VoiceRecord> {
        self.records.iter().find(|record| record.name == name)
    }

    /// Records whose lowercase name starts with the lowercase `prefix`, in
    /// catalog order.
    pub fn with_prefix(&self, prefix: &str) -> Vec<&VoiceRecord> {
        let prefix = prefix.to_lowercase();
        self.records
            .iter()
            .filter(|record| record.name.to_lowercase().starts_with(&prefix))
            .collect()
    }

    pub fn sorted_for_display(&self) -> Vec<&VoiceRecord> {
        sort_for_display(self.records.iter().collect())
    }
}

pub fn sort_for_display(mut records: Vec<&VoiceRecord>) -> Vec<&VoiceRecord> {
    records.sort_by(|a, b| a.language.cmp(&b.language).then_with(|| a.name.cmp(&b.name)));
    records
}

/// Kokoro-style names encode the language in their first letter followed by
/// a gender marker (`af_heart`, `bm_lewis`). Anything else is treated as the
/// default English voice.
pub fn language_for_voice(name: &str) -> String {
    let mut chars = name.chars();
    let (Some(lang), Some(gender), Some('_')) = (chars.next(), chars.next(), chars.next()) else {
        return DEFAULT_LANGUAGE.to_string();
    };
    if !matches!(gender, 'f' | 'm') {
        return DEFAULT_LANGUAGE.to_string();
    }
    let code = match lang {
        'a' => "en-us",
        'b' => "en-gb",
        'e' => "es",
        'f' => "fr-fr",
        'h' => "hi",
        'i' => "it",
        'j' => "ja",
        'p' => "pt-br",
        'z' => "cmn",
        _ => DEFAULT_LANGUAGE,
    };
    code.to_string()
}
