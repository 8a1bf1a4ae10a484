use crate::engine::provider::TrackMetadata;
use anyhow::Context;
use sanitize_filename::sanitize;
use std::path::Path;
use url::Url;

/// Separators that split a credited-artists string into individual artists.
const ARTIST_DELIMITERS: [&str; 5] = [", ", " & ", " feat. ", " ft. ", " featuring "];

/// First credited artist of `artists`, or the whole string when there is only one.
pub fn first_artist(artists: &str) -> String {
  let cut = ARTIST_DELIMITERS
    .iter()
    .filter_map(|d| artists.find(d))
    .min()
    .unwrap_or(artists.len());
  artists[..cut].trim().to_string()
}

/// Expands a filename template such as `{track_number}. {track_name}` and
/// appends `ext`. Returns `None` when nothing usable is left after sanitizing.
pub fn render_track_filename(template: &str, meta: &TrackMetadata, ext: &str) -> Option<String> {
  let track_number = if meta.track_number > 0 {
    format!("{:02}", meta.track_number)
  } else {
    String::new()
  };
  let disc_number = if meta.disc_number > 0 {
    meta.disc_number.to_string()
  } else {
    String::new()
  };
  let year: String = meta.release_date.chars().take(4).collect();

  let mut out = template.to_string();
  for (key, value) in [
    ("{track_name}", meta.track_name.as_str()),
    ("{title}", meta.track_name.as_str()),
    ("{artist_name}", meta.artist_name.as_str()),
    ("{artist}", meta.artist_name.as_str()),
    ("{album_artist}", meta.album_artist.as_str()),
    ("{album}", meta.album_name.as_str()),
    ("{track_number}", track_number.as_str()),
    ("{disc_number}", disc_number.as_str()),
    ("{year}", year.as_str()),
  ] {
    out = out.replace(key, value);
  }

  // A missing track number leaves "`. Title`" behind.
  let stem = sanitize(out.trim().trim_start_matches(". ").trim());
  if stem.is_empty() || stem == "." {
    return None;
  }
  let ext = ext.trim().trim_start_matches('.');
  if ext.is_empty() {
    Some(stem)
  } else {
    Some(format!("{stem}.{ext}"))
  }
}

/// Last non-empty path segment of `url`, decoded and sanitized.
pub fn filename_from_url(url: &Url) -> Option<String> {
  let seg = url
    .path_segments()
    .and_then(|s| s.filter(|s| !s.is_empty()).last())?;
  let s = sanitize(decode_filename_like(seg));
  if s.is_empty() || s == "." {
    None
  } else {
    Some(s)
  }
}

fn decode_filename_like(s: &str) -> String {
  // URL path segments may be percent-encoded.
  match urlencoding::decode(s) {
    Ok(v) => v.into_owned(),
    Err(_) => s.replace("%20", " "),
  }
}

pub fn ensure_dir(dest_dir: &Path) -> anyhow::Result<()> {
  std::fs::create_dir_all(dest_dir).context("failed to create destination dir")
}
