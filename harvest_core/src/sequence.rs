//! Helpers for rebuilding sequential image URLs from a numbered seed.
//!
//! Many galleries serve images as `…/img/<gallery>/001.jpg`, `002.jpg`, …
//! while only exposing the first few in the page markup. When the page also
//! advertises a total count, the full URL list can be rebuilt from the seed.

use url::Url;

/// Decomposed form of a `…/<digits>.<ext>` image URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSeed {
    /// Origin plus directory path, with a trailing slash.
    pub base: String,
    /// Width of the zero-padded number in the file name.
    pub number_width: usize,
    pub extension: String,
    pub start_index: u32,
}

/// Extract a sequence seed from an image URL whose file name is a plain
/// zero-padded number with a short alphanumeric extension.
pub fn extract_sequence_seed(image_url: &str) -> Option<SequenceSeed> {
    let parsed = Url::parse(image_url).ok()?;
    let (dir, file) = parsed.path().rsplit_once('/')?;
    let (stem, extension) = file.rsplit_once('.')?;
    if stem.is_empty() || !stem.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if !(2..=5).contains(&extension.len()) || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    let start_index: u32 = stem.parse().ok()?;
    if start_index < 1 {
        return None;
    }
    let origin = match parsed.host_str() {
        Some(host) => match parsed.port() {
            Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
            None => format!("{}://{}", parsed.scheme(), host),
        },
        None => String::new(),
    };
    Some(SequenceSeed {
        base: format!("{}{}/", origin, dir),
        number_width: stem.len(),
        extension: extension.to_string(),
        start_index,
    })
}

/// Build one image URL from a seed, keeping the zero-padding width.
pub fn build_sequence_url(seed: &SequenceSeed, index: u32) -> String {
    format!(
        "{}{:0width$}.{}",
        seed.base,
        index,
        seed.extension,
        width = seed.number_width
    )
}

/// Extend a parsed URL list to `target` entries when its first entry carries
/// a rebuildable numeric sequence. Returns `None` when the list is already
/// long enough or no seed can be extracted.
pub fn expand_image_urls(urls: &[String], target: usize) -> Option<Vec<String>> {
    if target <= urls.len() {
        return None;
    }
    let seed = extract_sequence_seed(urls.first()?)?;
    Some(
        (0..target as u32)
            .map(|offset| build_sequence_url(&seed, seed.start_index + offset))
            .collect(),
    )
}

/// When every URL in the list shares one numeric sequence pattern, return the
/// common seed and the highest index seen. Used to fill interior gaps when a
/// gallery exposes a sparse subset of a contiguous sequence.
pub fn infer_sequence_span(urls: &[String]) -> Option<(SequenceSeed, u32)> {
    let seed = extract_sequence_seed(urls.first()?)?;
    let mut max_index = seed.start_index;
    for url in urls {
        let candidate = extract_sequence_seed(url)?;
        if candidate.base != seed.base
            || candidate.extension != seed.extension
            || candidate.number_width != seed.number_width
            || candidate.start_index < seed.start_index
        {
            return None;
        }
        max_index = max_index.max(candidate.start_index);
    }
    Some((seed, max_index))
}
