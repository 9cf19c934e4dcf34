//! Image filters for shared cache extraction.
//!
//! Each filter carries a status that moves through
//! `NotFound -> Happening -> {Ok, Found}` as the iteration progresses:
//! `Happening` while an image that matched it is being converted, `Ok` once
//! a match was written out, `Found` when a match was seen but never
//! successfully written. A conversion failure rolls `Happening` back to
//! `NotFound` so later matches still get their chance.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Byte-equal full image path.
    Path,
    /// Some non-final `/`-separated component equals the filter string.
    Directory,
    /// The final `/`-separated component equals the filter string.
    Filename,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    NotFound,
    Happening,
    Found,
    Ok,
}

#[derive(Debug, Clone)]
pub struct ImageFilter {
    pub kind: FilterKind,
    pub string: String,
    pub status: FilterStatus,
    /// Byte offset into the matched image path of the component that
    /// satisfied the filter, recorded by [`ImageFilter::matches`] for the
    /// write-path router.
    pub match_offset: usize,
}

impl ImageFilter {
    pub fn new(kind: FilterKind, string: &str) -> ImageFilter {
        ImageFilter {
            kind,
            string: string.to_string(),
            status: FilterStatus::NotFound,
            match_offset: 0,
        }
    }

    /// Whether at least one image matching this filter has been seen through
    /// to the write stage.
    pub fn was_parsed(&self) -> bool {
        matches!(self.status, FilterStatus::Found | FilterStatus::Ok)
    }

    /// Tests `path` against this filter, recording the match offset.
    pub fn matches(&mut self, path: &str) -> bool {
        match self.kind {
            FilterKind::Path => {
                if self.string == path {
                    self.match_offset = 0;
                    true
                } else {
                    false
                }
            }
            FilterKind::Filename => match path_has_filename(path, &self.string) {
                Some(offset) => {
                    self.match_offset = offset;
                    true
                }
                None => false,
            },
            FilterKind::Directory => match path_has_dir_component(path, &self.string) {
                Some(offset) => {
                    self.match_offset = offset;
                    true
                }
                None => false,
            },
        }
    }
}

/// Returns the start offset of the final path component if it equals `name`.
pub fn path_has_filename(path: &str, name: &str) -> Option<usize> {
    let start = path.rfind('/').map(|index| index + 1).unwrap_or(0);
    (&path[start..] == name).then_some(start)
}

/// Returns the start offset of the first non-final component equal to
/// `component`. Keeping the offset of the component itself preserves the
/// filtered sub-tree when the router builds a write path from it.
pub fn path_has_dir_component(path: &str, component: &str) -> Option<usize> {
    let mut start = 0;
    for part in path.split('/') {
        let end = start + part.len();
        if end >= path.len() {
            // The final component is a file name, not a directory.
            return None;
        }
        if !part.is_empty() && part == component {
            return Some(start);
        }
        start = end + 1;
    }
    None
}

/// Evaluates the whole filter list against one image path.
///
/// Fresh matches move `NotFound -> Happening`. Filters that already reached
/// `Found`/`Ok` are skipped entirely once the image is known to be selected,
/// avoiding redundant matching work.
pub fn should_parse_image(filters: &mut [ImageFilter], path: &str) -> bool {
    let mut should_parse = false;

    for filter in filters.iter_mut() {
        let parsed_filter = filter.was_parsed();
        if parsed_filter && should_parse {
            continue;
        }

        if filter.matches(path) {
            if !parsed_filter {
                filter.status = FilterStatus::Happening;
            }
            should_parse = true;
        }
    }

    should_parse
}

/// Rolls every `Happening` filter back to `NotFound` after a conversion
/// failure, so the filter keeps looking for a later match.
pub fn unmark_happening_filters(filters: &mut [ImageFilter]) {
    for filter in filters.iter_mut() {
        if filter.status == FilterStatus::Happening {
            filter.status = FilterStatus::NotFound;
        }
    }
}

/// Whether every filter reached `Ok`, i.e. there is nothing to warn about.
pub fn all_filters_ok(filters: &[ImageFilter]) -> bool {
    filters
        .iter()
        .all(|filter| filter.status == FilterStatus::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_matching() {
        assert_eq!(
            path_has_filename("/usr/lib/libSystem.B.dylib", "libSystem.B.dylib"),
            Some(9)
        );
        assert_eq!(path_has_filename("/usr/lib/libSystem.B.dylib", "libc.dylib"), None);
        assert_eq!(path_has_filename("bare.dylib", "bare.dylib"), Some(0));
        // A directory component with the same name doesn't count.
        assert_eq!(path_has_filename("/lib/name/other.dylib", "name"), None);
    }

    #[test]
    fn dir_component_matching() {
        // "lib" starts at offset 5; the returned offset preserves the
        // sub-tree "lib/libA.dylib".
        assert_eq!(path_has_dir_component("/usr/lib/libA.dylib", "lib"), Some(5));
        assert_eq!(path_has_dir_component("/usr/lib/libA.dylib", "usr"), Some(1));
        assert_eq!(path_has_dir_component("/usr/lib/libA.dylib", "private"), None);
        // The trailing file name is not a directory component.
        assert_eq!(path_has_dir_component("/usr/lib/libA.dylib", "libA.dylib"), None);
    }

    #[test]
    fn select_transitions_fresh_matches_to_happening() {
        let mut filters = vec![
            ImageFilter::new(FilterKind::Filename, "libA.dylib"),
            ImageFilter::new(FilterKind::Directory, "private"),
        ];
        assert!(should_parse_image(&mut filters, "/usr/lib/libA.dylib"));
        assert_eq!(filters[0].status, FilterStatus::Happening);
        assert_eq!(filters[1].status, FilterStatus::NotFound);
    }

    #[test]
    fn select_skips_already_parsed_filters() {
        let mut filters = vec![
            ImageFilter::new(FilterKind::Filename, "libA.dylib"),
            ImageFilter::new(FilterKind::Directory, "usr"),
        ];
        filters[1].status = FilterStatus::Ok;

        assert!(should_parse_image(&mut filters, "/usr/lib/libA.dylib"));
        // The completed filter is left alone.
        assert_eq!(filters[1].status, FilterStatus::Ok);
    }

    #[test]
    fn unmark_restores_not_found() {
        let mut filters = vec![ImageFilter::new(FilterKind::Filename, "libA.dylib")];
        filters[0].status = FilterStatus::Happening;
        unmark_happening_filters(&mut filters);
        assert_eq!(filters[0].status, FilterStatus::NotFound);

        filters[0].status = FilterStatus::Ok;
        unmark_happening_filters(&mut filters);
        assert_eq!(filters[0].status, FilterStatus::Ok);
    }

    #[test]
    fn no_match_means_no_parse() {
        let mut filters = vec![ImageFilter::new(FilterKind::Path, "/usr/lib/libB.dylib")];
        assert!(!should_parse_image(&mut filters, "/usr/lib/libA.dylib"));
        assert_eq!(filters[0].status, FilterStatus::NotFound);
    }
}
