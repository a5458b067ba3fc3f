use regex::Regex;

pub type PathList = Vec<String>;

/// Predicates over backend paths. Multiple filters are "or"d together:
/// `matching` globs where `*` matches any run of characters that are
/// neither `/` nor `:`, and `under` directory prefixes compared with
/// slashes trimmed.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    pub under: Vec<String>,
    pub matching: Vec<String>,
}

impl PathFilter {
    pub fn is_empty(&self) -> bool {
        self.under.is_empty() && self.matching.is_empty()
    }

    /// Keeps the paths for which any predicate holds. Does not modify the
    /// input.
    pub fn only(&self, paths: &[String]) -> PathList {
        paths
            .iter()
            .filter(|path| self.applies_to(path))
            .cloned()
            .collect()
    }

    /// Keeps the paths for which no predicate holds. Does not modify the
    /// input.
    pub fn except(&self, paths: &[String]) -> PathList {
        paths
            .iter()
            .filter(|path| !self.applies_to(path))
            .cloned()
            .collect()
    }

    fn applies_to(&self, path: &str) -> bool {
        self.matching
            .iter()
            .any(|pattern| path_matches(path, pattern))
            || self.under.iter().any(|dir| path_is_under(path, dir))
    }
}

fn path_matches(path: &str, pattern: &str) -> bool {
    let expr = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[^/:]*");

    match Regex::new(&format!("^{}$", expr)) {
        Ok(re) => re.is_match(path),
        Err(_) => false,
    }
}

fn path_is_under(path: &str, dir: &str) -> bool {
    path.trim_matches('/').starts_with(dir.trim_matches('/'))
}
