use crate::catalog::{VoiceCatalog, VoiceRecord};

pub const MAX_FUZZY_DISTANCE: usize = 2;

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    // Two rolling rows of the classic DP matrix.
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Catalog entries similar to `term`: a case-insensitive substring hit in the
/// name or language, or a name within [`MAX_FUZZY_DISTANCE`] edits. Results are
/// stably sorted by name distance, so equally distant entries keep catalog
/// order.
pub fn find_similar<'a>(catalog: &'a VoiceCatalog, term: &str) -> Vec<&'a VoiceRecord> {
    let term = term.to_lowercase();
    let mut scored: Vec<(usize, &VoiceRecord)> = catalog
        .records()
        .iter()
        .filter_map(|record| {
            let name = record.name.to_lowercase();
            let distance = levenshtein(&name, &term);
            let hit = name.contains(&term)
                || record.language.to_lowercase().contains(&term)
                || distance <= MAX_FUZZY_DISTANCE;
            hit.then_some((distance, record))
        })
        .collect();
    scored.sort_by_key(|(distance, _)| *distance);
    scored.into_iter().map(|(_, record)| record).collect()
}

pub fn did_you_mean<'a>(
    catalog: &'a VoiceCatalog,
    requested: &str,
    limit: usize,
) -> Vec<&'a VoiceRecord> {
    let mut similar = find_similar(catalog, requested);
    similar.truncate(limit);
    similar
}
