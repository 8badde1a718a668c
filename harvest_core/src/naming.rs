//! Naming rules for page directories, image files, and source ids.

use url::Url;

const FALLBACK_FILE_NAME: &str = "image.bin";

/// Extract the source id from a page URL: the last run of digits in the
/// final path segment, or the page number as text when none is present.
pub fn source_id_from_page_url(page_url: &str, page_num: i32) -> String {
    let path = Url::parse(page_url)
        .map(|url| url.path().to_string())
        .unwrap_or_else(|_| page_url.to_string());
    let last_segment = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    last_digit_run(last_segment).unwrap_or_else(|| page_num.to_string())
}

/// Zero-padded six-digit page directory name.
pub fn page_dir_name(page_num: i32) -> String {
    format!("{:06}", page_num)
}

/// Image file name derived from the URL's final path segment, percent-decoded
/// and sanitized for the filesystem.
pub fn image_file_name(image_url: &str) -> String {
    let path = Url::parse(image_url)
        .map(|url| url.path().to_string())
        .unwrap_or_else(|_| image_url.to_string());
    let decoded = urlencoding::decode(&path)
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| path.clone());
    let basename = decoded
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("");
    sanitize_file_name(basename)
}

fn last_digit_run(segment: &str) -> Option<String> {
    let mut runs = Vec::new();
    let mut current = String::new();
    for c in segment.chars() {
        if c.is_ascii_digit() {
            current.push(c);
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs.pop()
}

fn sanitize_file_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim().trim_matches('.');
    if trimmed.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_prefers_trailing_digits_of_last_segment() {
        assert_eq!(source_id_from_page_url("https://a.example/gallery/1234.html", 77), "1234");
        assert_eq!(source_id_from_page_url("https://a.example/path/no-id", 77), "77");
        assert_eq!(source_id_from_page_url("https://a.example/g/12/", 5), "12");
        // The last run wins when a segment carries several.
        assert_eq!(source_id_from_page_url("https://a.example/vol12-no34.html", 1), "34");
    }

    #[test]
    fn page_dir_name_is_zero_padded() {
        assert_eq!(page_dir_name(12), "000012");
        assert_eq!(page_dir_name(123456), "123456");
    }

    #[test]
    fn image_file_name_uses_decoded_basename() {
        assert_eq!(
            image_file_name("https://a.example/cat/pic-01.jpg?token=x"),
            "pic-01.jpg"
        );
        assert_eq!(image_file_name("https://a.example/cat/p%20ic.jpg"), "p ic.jpg");
    }

    #[test]
    fn image_file_name_sanitizes_reserved_characters() {
        assert_eq!(image_file_name("https://a.example/x/a:b*c.jpg"), "a_b_c.jpg");
        assert_eq!(image_file_name("https://a.example/x/..."), FALLBACK_FILE_NAME);
        assert_eq!(image_file_name("https://a.example/"), FALLBACK_FILE_NAME);
    }
}
