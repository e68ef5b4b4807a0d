use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::trace;
use zip::result::ZipError;
use zip::ZipArchive;

/// Class to load: a qualified name plus the class that referred to it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClassSource {
    pub qualified_name: String,
    /// Referring class, kept for diagnostics.
    pub origin: Option<String>,
}

impl ClassSource {
    /// Accepts either `com.example.Task` or `com/example/Task`.
    pub fn from_class_name(name: &str, origin: Option<&str>) -> Self {
        Self {
            qualified_name: name.replace('/', "."),
            origin: origin.map(|value| value.replace('/', ".")),
        }
    }

    pub fn internal_name(&self) -> String {
        self.qualified_name.replace('.', "/")
    }
}

/// One place classes can be read from.
#[derive(Clone, Debug)]
pub enum ClassPathEntry {
    Directory(PathBuf),
    Jar(PathBuf),
    /// Class bytes keyed by internal name.
    Memory(BTreeMap<String, Vec<u8>>),
}

impl ClassPathEntry {
    pub fn from_path(path: &Path) -> Result<Self> {
        if path.is_dir() {
            return Ok(ClassPathEntry::Directory(path.to_path_buf()));
        }
        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
        match extension {
            "jar" | "zip" => {
                if !path.is_file() {
                    anyhow::bail!("source not found: {}", path.display());
                }
                Ok(ClassPathEntry::Jar(path.to_path_buf()))
            }
            _ => anyhow::bail!("unsupported source: {}", path.display()),
        }
    }
}

/// Raw class bytes and where they came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassBytes {
    pub bytes: Vec<u8>,
    pub uri: String,
}

/// Ordered list of class path entries; the first match wins.
#[derive(Clone, Debug, Default)]
pub struct SourceSet {
    entries: Vec<ClassPathEntry>,
}

impl SourceSet {
    pub fn new(entries: Vec<ClassPathEntry>) -> Self {
        Self { entries }
    }

    pub fn from_paths(paths: &[PathBuf]) -> Result<Self> {
        let entries = paths
            .iter()
            .map(|path| ClassPathEntry::from_path(path))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn in_memory<I>(classes: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        Self {
            entries: vec![ClassPathEntry::Memory(classes.into_iter().collect())],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ClassPathEntry] {
        &self.entries
    }

    /// Look up a class by internal name.
    pub fn find(&self, internal_name: &str) -> Result<Option<ClassBytes>> {
        let entry_name = format!("{internal_name}.class");
        for entry in &self.entries {
            let found = match entry {
                ClassPathEntry::Directory(root) => read_from_directory(root, &entry_name)?,
                ClassPathEntry::Jar(path) => read_from_jar(path, &entry_name)?,
                ClassPathEntry::Memory(classes) => classes.get(internal_name).map(|bytes| ClassBytes {
                    bytes: bytes.clone(),
                    uri: format!("memory:/{}", entry_name),
                }),
            };
            if let Some(found) = found {
                trace!(class = internal_name, uri = %found.uri, "found class bytes");
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Internal names of every class available, sorted.
    pub fn class_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in &self.entries {
            match entry {
                ClassPathEntry::Directory(root) => list_directory(root, root, &mut names)?,
                ClassPathEntry::Jar(path) => list_jar(path, &mut names)?,
                ClassPathEntry::Memory(classes) => names.extend(classes.keys().cloned()),
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}

fn read_from_directory(root: &Path, entry_name: &str) -> Result<Option<ClassBytes>> {
    let path = root.join(entry_name);
    match fs::read(&path) {
        Ok(bytes) => Ok(Some(ClassBytes {
            bytes,
            uri: path_to_uri(&path),
        })),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn read_from_jar(path: &Path, entry_name: &str) -> Result<Option<ClassBytes>> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;
    let mut entry = match archive.by_name(entry_name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(error) => {
            return Err(error).with_context(|| format!("failed to read {}:{}", path.display(), entry_name));
        }
    };
    let mut bytes = Vec::new();
    entry
        .read_to_end(&mut bytes)
        .with_context(|| format!("failed to read {}:{}", path.display(), entry_name))?;
    Ok(Some(ClassBytes {
        bytes,
        uri: jar_entry_uri(path, entry_name),
    }))
}

fn list_directory(root: &Path, path: &Path, names: &mut Vec<String>) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry = entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }

    entries.sort_by_key(|entry| path_key(entry));

    for entry in entries {
        if entry.is_dir() {
            list_directory(root, &entry, names)?;
            continue;
        }
        let Ok(relative) = entry.strip_prefix(root) else {
            continue;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");
        if let Some(name) = class_entry_name(&relative) {
            names.push(name);
        }
    }
    Ok(())
}

fn list_jar(path: &Path, names: &mut Vec<String>) -> Result<()> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        if let Some(name) = class_entry_name(entry.name()) {
            names.push(name);
        }
    }
    Ok(())
}

fn class_entry_name(entry: &str) -> Option<String> {
    if entry.ends_with("module-info.class") || entry.ends_with("package-info.class") {
        return None;
    }
    entry
        .strip_suffix(".class")
        .filter(|name| !name.starts_with("META-INF/"))
        .map(|name| name.to_string())
}

fn path_to_uri(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn jar_entry_uri(jar_path: &Path, entry_name: &str) -> String {
    format!("jar:{}!/{}", jar_path.to_string_lossy(), entry_name)
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
