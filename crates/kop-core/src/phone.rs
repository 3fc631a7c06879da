//! Indonesian phone number normalization.
//!
//! Canonical form is country code + subscriber digits without punctuation
//! (`6281234567890`). Members type their numbers in every shape imaginable, and the
//! store may hold either the canonical or the local (`0812…`) variant.

const COUNTRY_CODE: &str = "62";

/// Normalize a raw phone string to canonical `62…` digits.
///
/// Accepts `0812…`, `812…`, `62812…` and `+62812…`, with any spaces, dashes, dots
/// or parentheses. Other shapes are returned as bare digits. Idempotent.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.starts_with(COUNTRY_CODE) {
        digits
    } else if let Some(rest) = digits.strip_prefix('0') {
        format!("{COUNTRY_CODE}{rest}")
    } else if digits.starts_with('8') {
        format!("{COUNTRY_CODE}{digits}")
    } else {
        digits
    }
}

/// Variants to try when looking a member up: canonical first, then the local
/// leading-zero form. Empty when the input holds no digits.
pub fn lookup_variants(raw: &str) -> Vec<String> {
    let canonical = normalize_phone(raw);
    if canonical.is_empty() {
        return Vec::new();
    }

    let mut out = vec![canonical.clone()];
    if let Some(rest) = canonical.strip_prefix(COUNTRY_CODE) {
        if !rest.is_empty() {
            out.push(format!("0{rest}"));
        }
    }
    out
}

/// Whether a normalized number looks like something we can address at all.
pub fn is_plausible(canonical: &str) -> bool {
    (8..=15).contains(&canonical.len()) && canonical.chars().all(|c| c.is_ascii_digit())
}
