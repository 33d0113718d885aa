//! Testset tree nodes.
//!
//! A testset is populated by exactly one build call (see
//! [`crate::definition`]) and handed out immutably afterwards. Child
//! testsets and tests are only ever appended.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::target::{Target, TargetConfig, DEFAULT_TARGET};
use super::test::Test;

#[derive(Debug, Clone)]
pub struct Testset {
    name: Option<String>,
    parent_full_name: Option<String>,
    path: PathBuf,
    source: Option<PathBuf>,
    targets: Vec<Target>,
    tests: Vec<Arc<Test>>,
    testsets: Vec<Testset>,
    load_error: Option<String>,
}

impl Testset {
    /// Fresh, empty root testset whose tests run in `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            name: None,
            parent_full_name: None,
            path: path.into(),
            source: None,
            targets: Vec::new(),
            tests: Vec::new(),
            testsets: Vec::new(),
            load_error: None,
        }
    }

    /// Fresh, empty testset that will be attached under `parent`.
    pub fn child_of(parent: &Testset, path: impl Into<PathBuf>) -> Self {
        let mut child = Self::new(path);
        child.parent_full_name = parent.full_name();
        child
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Hierarchical name; unnamed testsets are transparent.
    pub fn full_name(&self) -> Option<String> {
        match (&self.parent_full_name, &self.name) {
            (Some(parent), Some(name)) => Some(format!("{parent}:{name}")),
            (Some(parent), None) => Some(parent.clone()),
            (None, Some(name)) => Some(name.clone()),
            (None, None) => None,
        }
    }

    /// Name used for report files and table rows.
    pub fn display_name(&self) -> String {
        self.full_name().unwrap_or_else(|| {
            self.source
                .as_deref()
                .and_then(Path::file_stem)
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "testset".to_string())
        })
    }

    /// Directory the testset was defined in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Definition file this testset was built from.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn set_source(&mut self, source: impl Into<PathBuf>) {
        self.source = Some(source.into());
    }

    /// Declare a target; redeclaring a name replaces its configuration.
    pub fn add_target(&mut self, name: impl Into<String>, config: TargetConfig) -> &mut Self {
        let target = Target::new(name, config);
        match self.targets.iter_mut().find(|t| t.name == target.name) {
            Some(existing) => *existing = target,
            None => self.targets.push(target),
        }
        self
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn target(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Targets this testset's runs use.
    ///
    /// A testset declaring no targets inherits `inherited`. Otherwise its
    /// own targets are filtered by `active`, except that an active list of
    /// exactly `["default"]` selects all of them.
    pub fn effective_targets(&self, inherited: &[Target], active: &[String]) -> Vec<Target> {
        if self.targets.is_empty() {
            return inherited.to_vec();
        }
        let select_all = active.len() == 1 && active[0] == DEFAULT_TARGET;
        self.targets
            .iter()
            .filter(|t| select_all || active.iter().any(|a| *a == t.name))
            .cloned()
            .collect()
    }

    /// Append a new test and return a handle to populate it.
    pub fn new_test(&mut self, name: &str) -> &mut Test {
        let test = Test::new(name, self.full_name().as_deref(), &self.path);
        self.tests.push(Arc::new(test));
        let idx = self.tests.len() - 1;
        Arc::make_mut(&mut self.tests[idx])
    }

    /// Append a nested testset sharing this testset's directory.
    pub fn new_testset(&mut self, name: &str) -> &mut Testset {
        let mut child = Testset::child_of(self, self.path.clone());
        child.set_name(name);
        child.source = self.source.clone();
        self.push_testset(child)
    }

    /// Attach an already-built child (used for imports).
    pub fn push_testset(&mut self, child: Testset) -> &mut Testset {
        self.testsets.push(child);
        let idx = self.testsets.len() - 1;
        &mut self.testsets[idx]
    }

    pub fn tests(&self) -> &[Arc<Test>] {
        &self.tests
    }

    pub fn testsets(&self) -> &[Testset] {
        &self.testsets
    }

    /// Error that interrupted this testset's build, if any.
    pub fn load_error(&self) -> Option<&str> {
        self.load_error.as_deref()
    }

    pub fn set_load_error(&mut self, message: impl Into<String>) {
        self.load_error = Some(message.into());
    }

    /// Number of tests in this subtree.
    pub fn test_count(&self) -> usize {
        self.tests.len() + self.testsets.iter().map(Testset::test_count).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unnamed_testset_is_transparent() {
        let mut root = Testset::new("/t");
        root.set_name("soc");
        let anon = Testset::child_of(&root, "/t/sub");
        let anon = root.push_testset(anon);
        let test = anon.new_test("boot");
        assert_eq!(test.full_name(), "soc:boot");
    }

    #[test]
    fn test_nested_full_names() {
        let mut root = Testset::new("/t");
        root.set_name("soc");
        let cluster = root.new_testset("cluster");
        let test = cluster.new_test("dma");
        assert_eq!(test.full_name(), "soc:cluster:dma");
        assert_eq!(root.test_count(), 1);
    }

    #[test]
    fn test_add_target_replaces_same_name() {
        let mut root = Testset::new("/t");
        root.add_target("a", TargetConfig::default());
        let config = TargetConfig {
            skip: Some("later".to_string()),
            ..TargetConfig::default()
        };
        root.add_target("a", config);
        assert_eq!(root.targets().len(), 1);
        assert_eq!(root.target("a").and_then(|t| t.config.skip.as_deref()), Some("later"));
    }

    #[test]
    fn test_effective_targets() {
        let mut root = Testset::new("/t");
        let inherited = vec![Target::default()];
        let default = vec![DEFAULT_TARGET.to_string()];
        assert_eq!(root.effective_targets(&inherited, &default), inherited);

        root.add_target("a", TargetConfig::default());
        root.add_target("b", TargetConfig::default());
        let names = |targets: Vec<Target>| targets.into_iter().map(|t| t.name).collect::<Vec<_>>();
        assert_eq!(names(root.effective_targets(&inherited, &default)), vec!["a", "b"]);
        assert_eq!(names(root.effective_targets(&inherited, &["b".to_string()])), vec!["b"]);
        assert!(root.effective_targets(&inherited, &["c".to_string()]).is_empty());
    }

    #[test]
    fn test_display_name_falls_back_to_source_stem() {
        let mut root = Testset::new("/t");
        root.set_source("/t/regression.yaml");
        assert_eq!(root.display_name(), "regression");
    }
}
