use strsim::damerau_levenshtein;

pub const MAX_SUGGESTIONS: usize = 3;

/// Maximum edit distance for a fuzzy match.
const MAX_DISTANCE: usize = 2;

/// Common misspellings and colloquial words -> canonical command.
const TYPO_MAP: &[(&str, &str)] = &[
    ("slado", "saldo"),
    ("sado", "saldo"),
    ("saldoo", "saldo"),
    ("tabungan", "saldo"),
    ("cek", "saldo"),
    ("pinjman", "pinjaman"),
    ("pinjamn", "pinjaman"),
    ("hutang", "pinjaman"),
    ("utang", "pinjaman"),
    ("kredit", "pinjaman"),
    ("angsuran", "pinjaman"),
    ("profl", "profil"),
    ("data", "profil"),
    ("alamat", "kontak"),
    ("telepon", "kontak"),
    ("telp", "kontak"),
    ("bantu", "menu"),
    ("mnu", "menu"),
];

/// Rank canonical commands for an unknown `token`.
///
/// Order: typo map hit, then substring overlap with any keyword, then keywords
/// within [`MAX_DISTANCE`] edits (closest first). Deduplicated by canonical name.
pub(super) fn suggest<'a>(
    token: &str,
    keywords: impl Iterator<Item = (&'a str, &'static str)>,
) -> Vec<String> {
    let token = token.trim().to_lowercase();
    if token.is_empty() {
        return Vec::new();
    }

    let mut keywords: Vec<(&str, &'static str)> = keywords.collect();
    keywords.sort_unstable();

    let mut out: Vec<String> = Vec::new();

    for (typo, canonical) in TYPO_MAP {
        if *typo == token && keywords.iter().any(|(_, c)| c == canonical) {
            push(canonical, &mut out);
        }
    }

    if token.chars().count() >= 3 {
        for (kw, canonical) in &keywords {
            if kw.contains(token.as_str()) || token.contains(kw) {
                push(canonical, &mut out);
            }
        }
    }

    let mut close: Vec<(usize, &str)> = keywords
        .iter()
        .map(|(kw, canonical)| (damerau_levenshtein(&token, kw), *canonical))
        .filter(|(d, _)| *d <= MAX_DISTANCE)
        .collect();
    close.sort_by_key(|(d, _)| *d);
    for (_, canonical) in close {
        push(canonical, &mut out);
    }

    out
}

fn push(name: &str, out: &mut Vec<String>) {
    if out.len() < MAX_SUGGESTIONS && !out.iter().any(|s| s == name) {
        out.push(name.to_string());
    }
}
