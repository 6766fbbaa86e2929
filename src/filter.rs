use regex::Regex;

/// Decides which containers get their logs collected, based on their names.
///
/// Exclude patterns always win over include patterns. When no include
/// pattern is configured every container that is not excluded is eligible.
#[derive(Debug, Clone)]
pub struct NameFilter {
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
}

impl NameFilter {
    pub fn new<S: AsRef<str>>(includes: &[S], excludes: &[S]) -> Result<Self, regex::Error> {
        let compile = |patterns: &[S]| {
            patterns
                .iter()
                .map(|p| Regex::new(p.as_ref()))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            includes: compile(includes)?,
            excludes: compile(excludes)?,
        })
    }

    pub fn is_eligible<S: AsRef<str>>(&self, names: &[S]) -> bool {
        let names = || names.iter().map(AsRef::as_ref);

        if names().any(|name| self.excludes.iter().any(|re| re.is_match(name))) {
            return false;
        }
        if self.includes.is_empty() {
            return true;
        }
        names().any(|name| self.includes.iter().any(|re| re.is_match(name)))
    }
}
