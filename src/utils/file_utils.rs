//! File system utilities

use std::path::PathBuf;

use crate::core::models::{DownloadSource, FileType};

/// Sanitize filename for filesystem
pub fn sanitize_filename(filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    match sanitized.trim() {
        "" | "." | ".." => "download".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &str) -> PathBuf {
    let home = || directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf());

    if path == "~" {
        if let Some(home) = home() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home() {
            return home.join(rest);
        }
    }

    PathBuf::from(path)
}

/// Last path segment of a URL, used when no name was given
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()?;

    Some(sanitize_filename(segment))
}

/// Human readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

fn url_path_lower(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_lowercase(),
        Err(_) => url.to_lowercase(),
    }
}

fn has_extension(path: &str, extensions: &[&str]) -> bool {
    extensions
        .iter()
        .any(|ext| path.ends_with(&format!(".{}", ext)))
}

/// Guess the file category from the URL and the probed content type
pub fn classify_file_type(url: &str, content_type: Option<&str>) -> FileType {
    let url_lower = url.to_lowercase();
    let path = url_path_lower(url);
    let content_type = content_type.unwrap_or_default().to_lowercase();

    let video_hosts = ["youtube.com", "youtu.be", "vimeo.com", "tiktok.com"];
    if video_hosts.iter().any(|host| url_lower.contains(host)) || content_type.contains("video/") {
        return FileType::Video;
    }

    if has_extension(&path, &["mp3", "wav", "ogg"]) || content_type.contains("audio/") {
        return FileType::Audio;
    }

    if has_extension(&path, &["pdf", "doc", "docx", "txt"])
        || content_type.contains("application/pdf")
        || content_type.contains("text/")
    {
        return FileType::Document;
    }

    if has_extension(&path, &["jpg", "jpeg", "png", "gif"]) || content_type.contains("image/") {
        return FileType::Image;
    }

    if has_extension(&path, &["zip", "rar", "7z"])
        || content_type.contains("application/zip")
        || content_type.contains("application/x-rar-compressed")
    {
        return FileType::Archive;
    }

    if has_extension(&path, &["exe", "dmg", "apk"])
        || content_type.contains("application/octet-stream")
        || content_type.contains("application/x-msdownload")
    {
        return FileType::Application;
    }

    FileType::Other
}

/// Guess where a download comes from
pub fn classify_source(url: &str) -> DownloadSource {
    let url_lower = url.to_lowercase();
    let path = url_path_lower(url);

    if url_lower.contains("youtube.com") || url_lower.contains("youtu.be") {
        DownloadSource::Youtube
    } else if url_lower.contains("tiktok.com") {
        DownloadSource::Tiktok
    } else if ["netflix.com", "hulu.com", "amazon.com/video"]
        .iter()
        .any(|host| url_lower.contains(host))
    {
        DownloadSource::Moviebox
    } else if url_lower.contains("books.google.com") || has_extension(&path, &["pdf", "epub"]) {
        DownloadSource::Book
    } else if has_extension(&path, &["exe", "dmg", "apk"]) {
        DownloadSource::App
    } else {
        DownloadSource::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a/b:c?.mp4"), "a_b_c_.mp4");
        assert_eq!(sanitize_filename("  "), "download");
        assert_eq!(sanitize_filename(".."), "download");
    }

    #[test]
    fn test_filename_from_url() {
        assert_eq!(
            filename_from_url("https://example.com/files/report.pdf?x=1"),
            Some("report.pdf".to_string())
        );
        assert_eq!(filename_from_url("https://example.com/"), None);
    }

    #[test]
    fn test_expand_home_keeps_plain_paths() {
        assert_eq!(expand_home("/tmp/downloads"), PathBuf::from("/tmp/downloads"));
        assert_eq!(expand_home("~user/x"), PathBuf::from("~user/x"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_classify_file_type() {
        assert_eq!(
            classify_file_type("https://www.youtube.com/watch?v=1", None),
            FileType::Video
        );
        assert_eq!(
            classify_file_type("https://example.com/song.mp3", None),
            FileType::Audio
        );
        assert_eq!(
            classify_file_type("https://example.com/x", Some("application/pdf")),
            FileType::Document
        );
        assert_eq!(
            classify_file_type("https://example.com/photo.PNG", None),
            FileType::Image
        );
        assert_eq!(
            classify_file_type("https://example.com/a.7z", None),
            FileType::Archive
        );
        assert_eq!(
            classify_file_type("https://example.com/blob", Some("application/octet-stream")),
            FileType::Application
        );
        assert_eq!(
            classify_file_type("https://example.com/blob", None),
            FileType::Other
        );
    }

    #[test]
    fn test_classify_source() {
        assert_eq!(classify_source("https://youtu.be/abc"), DownloadSource::Youtube);
        assert_eq!(
            classify_source("https://www.tiktok.com/@a/video/1"),
            DownloadSource::Tiktok
        );
        assert_eq!(
            classify_source("https://www.netflix.com/title/1"),
            DownloadSource::Moviebox
        );
        assert_eq!(
            classify_source("https://example.com/novel.epub"),
            DownloadSource::Book
        );
        assert_eq!(
            classify_source("https://example.com/setup.exe"),
            DownloadSource::App
        );
        assert_eq!(
            classify_source("https://example.com/file.bin"),
            DownloadSource::Other
        );
    }
}
