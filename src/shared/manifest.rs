//! Reading package manifests and dependency declarations from a project tree.

use crate::shared::corpus;
use crate::shared::models::Ecosystem;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;
use walkdir::WalkDir;

static SETUP_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"name\s*=\s*['"]([^'"]+)['"]"#).unwrap());
static SETUP_VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"version\s*=\s*['"]([^'"]+)['"]"#).unwrap());

static PY_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:from\s+([A-Za-z0-9_.]+)\s+import|import\s+([A-Za-z0-9_.]+))").unwrap()
});

const VENV_DIRS: &[&str] = &["venv", ".venv", "env", ".env"];

const PY_STDLIB: &[&str] = &[
    "abc", "argparse", "asyncio", "base64", "collections", "contextlib", "copy", "csv",
    "dataclasses", "datetime", "enum", "functools", "glob", "hashlib", "http", "importlib",
    "io", "itertools", "json", "logging", "math", "os", "pathlib", "pickle", "platform",
    "random", "re", "shutil", "socket", "sqlite3", "string", "struct", "subprocess", "sys",
    "tempfile", "threading", "time", "traceback", "typing", "unittest", "urllib", "uuid",
    "warnings", "zipfile",
];

/// What a manifest declares about the package itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub ecosystem: Ecosystem,
    pub name: Option<String>,
    pub version: Option<String>,
    pub scripts: BTreeMap<String, String>,
}

/// A dependency named by the project, with the ecosystem it was declared in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeclaredDependency {
    pub name: String,
    pub ecosystem: Ecosystem,
}

/// `package.json` means npm; `setup.py`, `pyproject.toml` or `setup.cfg` means PyPI.
pub fn detect_ecosystem(dir: &Path) -> Ecosystem {
    if dir.join("package.json").is_file() {
        Ecosystem::Npm
    } else if ["setup.py", "pyproject.toml", "setup.cfg"]
        .iter()
        .any(|f| dir.join(f).is_file())
    {
        Ecosystem::Pypi
    } else {
        Ecosystem::Other
    }
}

/// Read whichever manifest `dir` carries. Unparseable manifests yield empty fields.
pub fn read_manifest(dir: &Path) -> Manifest {
    let ecosystem = detect_ecosystem(dir);
    let mut manifest = Manifest {
        ecosystem,
        ..Manifest::default()
    };
    match ecosystem {
        Ecosystem::Npm => {
            if let Some(json) = read_package_json(dir) {
                manifest.name = json_str(&json, "name");
                manifest.version = json_str(&json, "version");
                if let Some(scripts) = json.get("scripts").and_then(|s| s.as_object()) {
                    manifest.scripts = scripts
                        .iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                        .collect();
                }
            }
        }
        Ecosystem::Pypi => {
            let (name, version) = read_pyproject(dir).unwrap_or_default();
            manifest.name = name;
            manifest.version = version;
            if manifest.name.is_none() || manifest.version.is_none() {
                if let Ok(setup) = std::fs::read_to_string(dir.join("setup.py")) {
                    let capture = |re: &Regex| {
                        re.captures(&setup).map(|c| c[1].to_string())
                    };
                    manifest.name = manifest.name.or_else(|| capture(&SETUP_NAME_RE));
                    manifest.version = manifest.version.or_else(|| capture(&SETUP_VERSION_RE));
                }
            }
        }
        Ecosystem::Other => {}
    }
    manifest
}

fn read_package_json(dir: &Path) -> Option<serde_json::Value> {
    let text = std::fs::read_to_string(dir.join("package.json")).ok()?;
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(dir = %dir.display(), "unparseable package.json: {e}");
            None
        }
    }
}

fn json_str(json: &serde_json::Value, key: &str) -> Option<String> {
    json.get(key).and_then(|v| v.as_str()).map(String::from)
}

/// Name and version from `[project]`, or `[tool.poetry]` as a fallback.
fn read_pyproject(dir: &Path) -> Option<(Option<String>, Option<String>)> {
    let text = std::fs::read_to_string(dir.join("pyproject.toml")).ok()?;
    let doc: toml::Value = match toml::from_str(&text) {
        Ok(doc) => doc,
        Err(e) => {
            debug!(dir = %dir.display(), "unparseable pyproject.toml: {e}");
            return None;
        }
    };
    let table = doc
        .get("project")
        .or_else(|| doc.get("tool").and_then(|t| t.get("poetry")))?;
    let field = |key: &str| table.get(key).and_then(|v| v.as_str()).map(String::from);
    Some((field("name"), field("version")))
}

/// Dependencies from package.json and requirements.txt, sorted and deduplicated.
pub fn declared_dependencies(dir: &Path) -> Vec<DeclaredDependency> {
    let mut deps = Vec::new();

    if let Some(json) = read_package_json(dir) {
        for section in ["dependencies", "devDependencies"] {
            if let Some(map) = json.get(section).and_then(|s| s.as_object()) {
                deps.extend(map.keys().map(|name| DeclaredDependency {
                    name: name.clone(),
                    ecosystem: Ecosystem::Npm,
                }));
            }
        }
    }

    if let Ok(text) = std::fs::read_to_string(dir.join("requirements.txt")) {
        deps.extend(parse_requirements(&text).into_iter().map(|name| DeclaredDependency {
            name,
            ecosystem: Ecosystem::Pypi,
        }));
    }

    deps.sort();
    deps.dedup();
    deps
}

/// Requirement names, ignoring comments and `-r`/`-e` style options.
pub fn parse_requirements(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty() && !line.starts_with('-'))
        .filter_map(|line| {
            let end = line
                .find(|c: char| "[<>=!~;".contains(c) || c.is_whitespace())
                .unwrap_or(line.len());
            let name = line[..end].trim();
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

/// A dependency found on disk, with the directory holding its code.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct InstalledPackage {
    pub name: String,
    pub ecosystem: Ecosystem,
    pub version: Option<String>,
    pub path: PathBuf,
}

/// Packages installed under `node_modules`, including `@scope/name`.
pub fn installed_packages(dir: &Path) -> Vec<InstalledPackage> {
    let root = dir.join("node_modules");
    let mut found = Vec::new();
    let mut push = |name: String, path: PathBuf| {
        found.push(InstalledPackage {
            name: name.to_lowercase(),
            ecosystem: Ecosystem::Npm,
            version: None,
            path,
        })
    };
    for (name, path) in list_dirs(&root) {
        if name.starts_with('.') {
            continue;
        }
        if name.starts_with('@') {
            for (inner, inner_path) in list_dirs(&path) {
                push(format!("{name}/{inner}"), inner_path);
            }
        } else {
            push(name, path);
        }
    }
    found.sort();
    found
}

/// `site-packages` directories of the virtualenvs kept inside the project.
pub fn site_packages_dirs(dir: &Path) -> Vec<PathBuf> {
    let mut sites = Vec::new();
    for venv in VENV_DIRS.iter().map(|v| dir.join(v)).filter(|v| v.is_dir()) {
        sites.push(venv.join("Lib").join("site-packages"));
        for (name, path) in list_dirs(&venv.join("lib")) {
            if name.starts_with("python") {
                sites.push(path.join("site-packages"));
            }
        }
    }
    sites.retain(|p| p.is_dir());
    sites
}

/// Import packages installed into the project's virtualenvs.
///
/// Versions come from the matching `*.dist-info` directory when one exists.
/// The first virtualenv to provide a name wins.
pub fn installed_pypi_packages(dir: &Path) -> Vec<InstalledPackage> {
    let mut found: BTreeMap<String, InstalledPackage> = BTreeMap::new();
    for site in site_packages_dirs(dir) {
        let entries = list_dirs(&site);
        let versions: BTreeMap<String, String> = entries
            .iter()
            .filter_map(|(name, _)| name.strip_suffix(".dist-info"))
            .filter_map(|stem| stem.rsplit_once('-'))
            .map(|(dist, version)| (normalize_dist(dist), version.to_string()))
            .collect();

        for (name, path) in entries {
            if name.ends_with(".dist-info")
                || name.ends_with(".egg-info")
                || name.starts_with('_')
                || name.starts_with('.')
            {
                continue;
            }
            let name = name.to_lowercase();
            found.entry(name.clone()).or_insert_with(|| InstalledPackage {
                version: versions.get(&normalize_dist(&name)).cloned(),
                name,
                ecosystem: Ecosystem::Pypi,
                path,
            });
        }
    }
    found.into_values().collect()
}

/// PEP 503-style folding so `My-Package`, `my_package` and `my.package` agree.
pub fn normalize_dist(name: &str) -> String {
    name.to_lowercase().replace(['-', '.'], "_")
}

fn list_dirs(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|e| {
            let name = e.file_name().to_str()?.to_string();
            Some((name, e.path()))
        })
        .collect()
}

fn is_venv_root(entry: &walkdir::DirEntry) -> bool {
    entry.depth() == 1
        && entry.file_type().is_dir()
        && entry.file_name().to_str().is_some_and(|n| VENV_DIRS.contains(&n))
}

/// Third-party top-level modules imported by the project's Python files.
///
/// Standard-library modules and modules that live in the project itself are
/// left out. At most `max_files` files are read.
pub fn python_imports(dir: &Path, max_files: usize) -> Vec<String> {
    let files = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !corpus::is_skipped_dir(e) && !is_venv_root(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "py"))
        .take(max_files);

    let mut found = BTreeSet::new();
    for entry in files {
        let Ok(text) = std::fs::read_to_string(entry.path()) else {
            debug!(path = %entry.path().display(), "skipping unreadable python file");
            continue;
        };
        for caps in text.lines().filter_map(|line| PY_IMPORT_RE.captures(line)) {
            let module = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            let base = module.split('.').next().unwrap_or("").to_lowercase();
            if base.is_empty() || PY_STDLIB.contains(&base.as_str()) {
                continue;
            }
            found.insert(base);
        }
    }

    found
        .into_iter()
        .filter(|m| !dir.join(format!("{m}.py")).is_file() && !dir.join(m).is_dir())
        .collect()
}
