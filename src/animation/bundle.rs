//! Resolves an animation source and its `imports` closure into one self-contained bundle.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use anyhow::Context as _;

use crate::{
    animation::schema::LibraryDef,
    foundation::error::{FramesmithError, FramesmithResult},
};

/// Maximum import nesting; deeper chains are rejected rather than followed.
const MAX_IMPORT_DEPTH: usize = 32;

/// A bundled module document plus the files it was assembled from.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub value: serde_json::Value,
    pub source_path: PathBuf,
    /// Every file read while bundling, entry file first.
    pub dependencies: Vec<PathBuf>,
}

impl Bundle {
    /// Write the bundle document, creating parent directories as needed.
    pub fn write_to(&self, path: &Path) -> FramesmithResult<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create bundle dir '{}'", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(&self.value)
            .map_err(|e| FramesmithError::build(format!("serialize bundle: {e}")))?;
        std::fs::write(path, bytes)
            .with_context(|| format!("write bundle '{}'", path.display()))?;
        Ok(())
    }
}

/// Builds bundles from one entry source file.
#[derive(Debug, Clone)]
pub struct BundleBuilder {
    entry: PathBuf,
}

impl BundleBuilder {
    pub fn new(entry: impl Into<PathBuf>) -> Self {
        Self {
            entry: entry.into(),
        }
    }

    pub fn entry(&self) -> &Path {
        &self.entry
    }

    /// Resolve the import closure of the entry file into a single document.
    ///
    /// Imported definitions are merged into the entry's `definitions` and `imports` is removed.
    /// Import cycles and definitions declared twice anywhere in the closure are build errors.
    #[tracing::instrument(skip(self), fields(entry = %self.entry.display()))]
    pub fn build(&self) -> FramesmithResult<Bundle> {
        let entry = canonical(&self.entry)?;
        let mut value = read_json(&entry)?;
        let obj = value.as_object_mut().ok_or_else(|| {
            FramesmithError::build(format!(
                "'{}' must contain a JSON object",
                entry.display()
            ))
        })?;

        let imports = match obj.remove("imports") {
            None => Vec::new(),
            Some(v) => serde_json::from_value::<Vec<String>>(v).map_err(|e| {
                FramesmithError::build(format!(
                    "'{}': imports must be a list of paths: {e}",
                    entry.display()
                ))
            })?,
        };
        let own: BTreeMap<String, String> = match obj.remove("definitions") {
            None => BTreeMap::new(),
            Some(v) => serde_json::from_value(v).map_err(|e| {
                FramesmithError::build(format!(
                    "'{}': definitions must map names to expressions: {e}",
                    entry.display()
                ))
            })?,
        };

        let mut resolver = Resolver {
            dependencies: vec![entry.clone()],
            visited: BTreeSet::from([entry.clone()]),
            in_progress: vec![entry.clone()],
            merged: BTreeMap::new(),
        };
        for import in &imports {
            resolver.visit(&entry, import)?;
        }
        resolver.in_progress.pop();

        for (name, expr) in own {
            resolver.insert(name, expr, &entry)?;
        }

        let definitions: serde_json::Map<String, serde_json::Value> = resolver
            .merged
            .into_iter()
            .map(|(name, (expr, _))| (name, serde_json::Value::String(expr)))
            .collect();
        if !definitions.is_empty() {
            obj.insert(
                "definitions".to_owned(),
                serde_json::Value::Object(definitions),
            );
        }

        tracing::debug!(files = resolver.dependencies.len(), "bundle resolved");
        Ok(Bundle {
            value,
            source_path: entry,
            dependencies: resolver.dependencies,
        })
    }
}

struct Resolver {
    dependencies: Vec<PathBuf>,
    visited: BTreeSet<PathBuf>,
    in_progress: Vec<PathBuf>,
    /// Definition name -> (expression, declaring file).
    merged: BTreeMap<String, (String, PathBuf)>,
}

impl Resolver {
    fn visit(&mut self, importer: &Path, spec: &str) -> FramesmithResult<()> {
        let base = importer.parent().unwrap_or_else(|| Path::new("."));
        let path = canonical(&base.join(spec)).map_err(|e| {
            FramesmithError::build(format!(
                "'{}': cannot resolve import '{spec}': {e}",
                importer.display()
            ))
        })?;

        if let Some(pos) = self.in_progress.iter().position(|p| p == &path) {
            let chain = self.in_progress[pos..]
                .iter()
                .chain(std::iter::once(&path))
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(FramesmithError::build(format!(
                "import cycle detected: {chain}"
            )));
        }
        if !self.visited.insert(path.clone()) {
            return Ok(());
        }
        if self.in_progress.len() > MAX_IMPORT_DEPTH {
            return Err(FramesmithError::build(format!(
                "import chain deeper than {MAX_IMPORT_DEPTH} at '{}'",
                path.display()
            )));
        }

        self.dependencies.push(path.clone());
        let library: LibraryDef = serde_json::from_value(read_json(&path)?).map_err(|e| {
            FramesmithError::build(format!(
                "'{}' is not a definitions library: {e}",
                path.display()
            ))
        })?;

        self.in_progress.push(path.clone());
        for import in &library.imports {
            self.visit(&path, import)?;
        }
        self.in_progress.pop();

        for (name, expr) in library.definitions {
            self.insert(name, expr, &path)?;
        }
        Ok(())
    }

    fn insert(&mut self, name: String, expr: String, from: &Path) -> FramesmithResult<()> {
        if let Some((_, first)) = self.merged.get(&name) {
            return Err(FramesmithError::build(format!(
                "definition '{name}' declared in both '{}' and '{}'",
                first.display(),
                from.display()
            )));
        }
        self.merged.insert(name, (expr, from.to_path_buf()));
        Ok(())
    }
}

fn canonical(path: &Path) -> FramesmithResult<PathBuf> {
    std::fs::canonicalize(path)
        .map_err(|e| FramesmithError::build(format!("'{}': {e}", path.display())))
}

fn read_json(path: &Path) -> FramesmithResult<serde_json::Value> {
    let bytes = std::fs::read(path)
        .map_err(|e| FramesmithError::build(format!("read '{}': {e}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| FramesmithError::build(format!("'{}' is not valid JSON: {e}", path.display())))
}
