//! Pure path classification: which files are in scope, which are cleanup
//! candidates, and how a skip name maps back to the original it replaced.
//!
//! Nothing in this module touches the filesystem. Every predicate is
//! O(number of rules) so the classifier can be consulted per-path during a
//! full-tree enumeration. All matching is ASCII case-insensitive, matching
//! the case-insensitive identity of [`crate::record::FileRecord`].

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use crate::record::path_key;

/// Directory under the library root that holds generated renditions. The
/// on-disk layout `{root}/_derivatives/{height}/...` is a stable interface.
pub const DERIVATIVES_DIR: &str = "_derivatives";

/// Naming rules that decide whether a path is part of the gallery.
///
/// Skip prefixes and suffixes apply to a file name (suffixes before the
/// extension) or to any ancestor folder segment. Skip substrings apply to
/// any path segment and are deliberately not reversible.
#[derive(Clone, Debug)]
pub struct ClassificationRules {
    pub image_extensions: Vec<String>,
    pub video_extensions: Vec<String>,
    pub skip_prefixes: Vec<String>,
    pub skip_suffixes: Vec<String>,
    pub skip_contains: Vec<String>,
}

impl Default for ClassificationRules {
    fn default() -> Self {
        Self {
            image_extensions: vec![".jpg", ".jpeg", ".png", ".webp"]
                .into_iter()
                .map(String::from)
                .collect(),
            video_extensions: vec![".mp4", ".mov", ".avi", ".3gp"]
                .into_iter()
                .map(String::from)
                .collect(),
            skip_prefixes: vec!["skip_", "pss_", "noW_"]
                .into_iter()
                .map(String::from)
                .collect(),
            skip_suffixes: vec!["_skip", "_pss", "_noW"]
                .into_iter()
                .map(String::from)
                .collect(),
            skip_contains: Vec::new(),
        }
    }
}

impl ClassificationRules {
    fn normalized(mut self) -> Self {
        let lower = |items: &mut Vec<String>| {
            for item in items.iter_mut() {
                *item = item.to_ascii_lowercase();
            }
            items.retain(|item| !item.is_empty());
        };
        lower(&mut self.image_extensions);
        lower(&mut self.video_extensions);
        lower(&mut self.skip_prefixes);
        lower(&mut self.skip_suffixes);
        lower(&mut self.skip_contains);
        self
    }
}

/// Decides, per path, whether it should be processed, ignored, or treated as
/// a cleanup candidate, and reconstructs original names from skip names.
#[derive(Clone, Debug)]
pub struct FileClassifier {
    root: PathBuf,
    derivatives_base: PathBuf,
    rules: ClassificationRules,
}

impl FileClassifier {
    pub fn new(root: impl Into<PathBuf>, rules: ClassificationRules) -> Self {
        let root = root.into();
        let derivatives_base = root.join(DERIVATIVES_DIR);
        Self {
            root,
            derivatives_base,
            rules: rules.normalized(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn derivatives_base(&self) -> &Path {
        &self.derivatives_base
    }

    pub fn rules(&self) -> &ClassificationRules {
        &self.rules
    }

    /// Lowercased dotted extension of `path`, if any.
    fn extension_of(path: &Path) -> Option<String> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
    }

    pub fn allows_extension(&self, path: &Path) -> bool {
        match Self::extension_of(path) {
            Some(ext) => {
                self.rules.image_extensions.contains(&ext)
                    || self.rules.video_extensions.contains(&ext)
            }
            None => false,
        }
    }

    pub fn is_video(&self, path: &Path) -> bool {
        match Self::extension_of(path) {
            Some(ext) => self.rules.video_extensions.contains(&ext),
            None => false,
        }
    }

    /// True when `path` lies inside the derivatives zone of the library root.
    pub fn in_derivatives(&self, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(&self.root) else {
            return false;
        };
        match rel.components().next() {
            Some(Component::Normal(first)) => first
                .to_str()
                .is_some_and(|s| s.eq_ignore_ascii_case(DERIVATIVES_DIR)),
            _ => false,
        }
    }

    /// True when the file name or any ancestor folder segment matches a skip
    /// prefix, suffix, or substring rule.
    pub fn matches_skip(&self, path: &Path) -> bool {
        let segments = self.segments_of(path);
        let Some((name, folders)) = segments.split_last() else {
            return false;
        };

        let (stem, _ext) = split_name(name);
        if self
            .rules
            .skip_prefixes
            .iter()
            .any(|p| starts_with_ci(name, p))
        {
            return true;
        }
        if self
            .rules
            .skip_suffixes
            .iter()
            .any(|s| ends_with_ci(stem, s))
        {
            return true;
        }

        for folder in folders {
            if self
                .rules
                .skip_prefixes
                .iter()
                .any(|p| starts_with_ci(folder, p))
                || self
                    .rules
                    .skip_suffixes
                    .iter()
                    .any(|s| ends_with_ci(folder, s))
            {
                return true;
            }
        }

        segments.iter().any(|segment| {
            let lowered = segment.to_ascii_lowercase();
            self.rules.skip_contains.iter().any(|c| lowered.contains(c))
        })
    }

    /// A path is in scope when its extension is allowed, it is not a
    /// generated derivative, and no skip rule matches it.
    pub fn should_process(&self, path: &Path) -> bool {
        self.allows_extension(path) && !self.in_derivatives(path) && !self.matches_skip(path)
    }

    /// A path is a cleanup candidate when it looks like a plausible original
    /// (allowed extension, outside the derivatives zone) but currently fails
    /// inclusion - the signal that something was renamed into exclusion.
    pub fn should_clean(&self, path: &Path) -> bool {
        self.allows_extension(path) && !self.in_derivatives(path) && self.matches_skip(path)
    }

    /// Reconstruct every original path a skip path could have replaced, by
    /// stripping whichever skip prefix or suffix matched the file name or an
    /// ancestor folder segment. File-level and folder-level forms are tried
    /// independently, first matching rule per form.
    ///
    /// Substring rules yield nothing: a name that merely *contains* a skip
    /// token gives no way to know what the original looked like.
    pub fn original_candidates(&self, path: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut push = |candidate: PathBuf, out: &mut Vec<PathBuf>| {
            if seen.insert(path_key(&candidate)) {
                out.push(candidate);
            }
        };

        if self.in_derivatives(path) {
            return out;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return out;
        };

        // File name with a skip prefix: "skip_photo.jpg" -> "photo.jpg".
        if let Some(prefix) = self
            .rules
            .skip_prefixes
            .iter()
            .find(|p| starts_with_ci(name, p))
        {
            let stripped = &name[prefix.len()..];
            if !split_name(stripped).0.is_empty() {
                push(path.with_file_name(stripped), &mut out);
            }
        }

        // File stem with a skip suffix: "photo_skip.jpg" -> "photo.jpg".
        let (stem, ext) = split_name(name);
        if let Some(suffix) = self
            .rules
            .skip_suffixes
            .iter()
            .find(|s| ends_with_ci(stem, s))
        {
            let stripped = &stem[..stem.len() - suffix.len()];
            if !stripped.is_empty() {
                push(path.with_file_name(format!("{stripped}{ext}")), &mut out);
            }
        }

        // Ancestor folder segments, nearest first, up to the library root.
        for ancestor in path.ancestors().skip(1) {
            if ancestor == self.root {
                break;
            }
            let Some(parent) = ancestor.parent() else {
                break;
            };
            let Some(segment) = ancestor.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(tail) = path.strip_prefix(ancestor) else {
                continue;
            };

            if let Some(prefix) = self
                .rules
                .skip_prefixes
                .iter()
                .find(|p| starts_with_ci(segment, p))
            {
                let stripped = &segment[prefix.len()..];
                if !stripped.is_empty() {
                    push(parent.join(stripped).join(tail), &mut out);
                }
            }
            if let Some(suffix) = self
                .rules
                .skip_suffixes
                .iter()
                .find(|s| ends_with_ci(segment, s))
            {
                let stripped = &segment[..segment.len() - suffix.len()];
                if !stripped.is_empty() {
                    push(parent.join(stripped).join(tail), &mut out);
                }
            }
        }

        out
    }

    /// Path segments considered for skip matching: relative to the library
    /// root when the path lives under it, otherwise the path's own normal
    /// components.
    fn segments_of(&self, path: &Path) -> Vec<String> {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .filter_map(|component| match component {
                Component::Normal(seg) => seg.to_str().map(String::from),
                _ => None,
            })
            .collect()
    }
}

/// Split a file name into stem and dotted extension ("photo_skip.jpg" ->
/// ("photo_skip", ".jpg")). Leading-dot names keep the dot in the stem.
fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

fn starts_with_ci(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

fn ends_with_ci(s: &str, suffix: &str) -> bool {
    s.len() >= suffix.len()
        && s.as_bytes()[s.len() - suffix.len()..].eq_ignore_ascii_case(suffix.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> FileClassifier {
        let rules = ClassificationRules {
            skip_contains: vec!["EosRP".into()],
            ..ClassificationRules::default()
        };
        FileClassifier::new("/library", rules)
    }

    #[test]
    fn plain_media_is_processed() {
        let c = classifier();
        assert!(c.should_process(Path::new("/library/a/b/photo.jpg")));
        assert!(c.should_process(Path::new("/library/a/clip.MP4")));
        assert!(!c.should_clean(Path::new("/library/a/b/photo.jpg")));
    }

    #[test]
    fn disallowed_extensions_are_ignored_entirely() {
        let c = classifier();
        assert!(!c.should_process(Path::new("/library/a/notes.txt")));
        assert!(!c.should_clean(Path::new("/library/a/skip_notes.txt")));
        assert!(!c.should_process(Path::new("/library/a/no_extension")));
    }

    #[test]
    fn derivatives_zone_is_excluded() {
        let c = classifier();
        let derivative = Path::new("/library/_derivatives/400/a/photo.jpg");
        assert!(c.in_derivatives(derivative));
        assert!(!c.should_process(derivative));
        assert!(!c.should_clean(derivative));
        assert!(c.original_candidates(derivative).is_empty());
    }

    #[test]
    fn skip_prefix_and_suffix_match_file_names() {
        let c = classifier();
        assert!(!c.should_process(Path::new("/library/a/skip_photo.jpg")));
        assert!(!c.should_process(Path::new("/library/a/photo_skip.jpg")));
        assert!(c.should_clean(Path::new("/library/a/skip_photo.jpg")));
        assert!(c.should_clean(Path::new("/library/a/photo_skip.jpg")));
    }

    #[test]
    fn skip_rules_match_any_ancestor_folder() {
        let c = classifier();
        assert!(!c.should_process(Path::new("/library/skip_trip/photo.jpg")));
        assert!(!c.should_process(Path::new("/library/trip_skip/day1/photo.jpg")));
        assert!(c.should_clean(Path::new("/library/skip_trip/photo.jpg")));
    }

    #[test]
    fn contains_rule_matches_case_insensitively() {
        let c = classifier();
        assert!(!c.should_process(Path::new("/library/eosrp/photo.jpg")));
        assert!(!c.should_process(Path::new("/library/a/IMG_EosRP_1.jpg")));
        assert!(c.should_clean(Path::new("/library/a/IMG_EosRP_1.jpg")));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let c = classifier();
        assert!(!c.should_process(Path::new("/library/a/SKIP_photo.jpg")));
        assert!(!c.should_process(Path::new("/library/a/photo_SKIP.jpg")));
    }

    #[test]
    fn file_prefix_reconstruction() {
        let c = classifier();
        let candidates = c.original_candidates(Path::new("/library/a/skip_photo.jpg"));
        assert_eq!(candidates, vec![PathBuf::from("/library/a/photo.jpg")]);
    }

    #[test]
    fn file_suffix_reconstruction_keeps_extension() {
        let c = classifier();
        let candidates = c.original_candidates(Path::new("/library/a/photo_skip.jpg"));
        assert_eq!(candidates, vec![PathBuf::from("/library/a/photo.jpg")]);
    }

    #[test]
    fn folder_reconstruction_covers_any_ancestor() {
        let c = classifier();
        let candidates = c.original_candidates(Path::new("/library/a/skip_b/photo.jpg"));
        assert_eq!(candidates, vec![PathBuf::from("/library/a/b/photo.jpg")]);

        let deep = c.original_candidates(Path::new("/library/skip_a/b/photo.jpg"));
        assert_eq!(deep, vec![PathBuf::from("/library/a/b/photo.jpg")]);
    }

    #[test]
    fn all_matching_forms_are_attempted() {
        let c = classifier();
        let mut candidates = c.original_candidates(Path::new("/library/skip_a/photo_skip.jpg"));
        candidates.sort();
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/library/a/photo_skip.jpg"),
                PathBuf::from("/library/skip_a/photo.jpg"),
            ]
        );
    }

    #[test]
    fn contains_rules_are_not_reversible() {
        let c = classifier();
        // Matches only the "EosRP" substring rule: no original can be derived.
        assert!(c.should_clean(Path::new("/library/a/IMG_EosRP_1.jpg")));
        assert!(
            c.original_candidates(Path::new("/library/a/IMG_EosRP_1.jpg"))
                .is_empty()
        );
    }

    #[test]
    fn stripping_to_an_empty_name_yields_no_candidate() {
        let c = classifier();
        assert!(
            c.original_candidates(Path::new("/library/a/skip_.jpg"))
                .is_empty()
        );
    }
}
