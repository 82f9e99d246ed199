//! Mapping between editor-side (local) and debugger-side (remote) file paths.
//!
//! Three modes, fixed for the life of a session:
//!
//! - explicit rules (`remotePath` / `substitutePath`): ordered prefix
//!   substitutions, first match wins;
//! - inference (remote attach without rules): the remote package and source
//!   lists reported by Delve are matched against the local file system;
//! - passthrough otherwise.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use godap_delve::types::PackageBuildInfo;
use regex::Regex;
use serde::Deserialize;
use walkdir::WalkDir;

/// One `substitutePath` entry as written in the launch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubstitutePath {
    pub from: String,
    pub to: String,
}

/// A normalized prefix substitution: `from` is local, `to` is remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRule {
    pub from: String,
    pub to: String,
}

/// Upper-cases a drive letter and turns every `\` into `/`.
pub fn normalize_separators(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.chars();
    if path.as_bytes().get(1) == Some(&b':') {
        if let Some(drive) = chars.next() {
            out.extend(drive.to_uppercase());
        }
    }
    out.extend(chars.map(|c| if c == '\\' { '/' } else { c }));
    out
}

pub fn find_path_separator(path: &str) -> char {
    if path.contains('\\') {
        '\\'
    } else {
        '/'
    }
}

/// Escapes a path the way the Go module cache does (`GitHub` -> `!git!hub`).
pub fn escape_go_module_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Last segment of a `/` or `\` separated path.
pub fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn segments(path: &str) -> impl DoubleEndedIterator<Item = &str> {
    path.split(['/', '\\'])
}

/// Picks the candidate sharing the longest run of trailing path segments with
/// `target`. Ties keep the earliest candidate.
///
/// `bar/main.go` beats `y/main.go` for the target `/foo/bar/main.go`.
pub fn find_path_with_best_matching_suffix<'a, S: AsRef<str>>(
    target: &str,
    candidates: &'a [S],
) -> Option<&'a str> {
    match candidates {
        [] => None,
        [only] => Some(only.as_ref()),
        _ => {
            let mut best = candidates[0].as_ref();
            let mut best_shared = 0usize;
            for candidate in candidates {
                let shared = segments(target)
                    .rev()
                    .zip(segments(candidate.as_ref()).rev())
                    .take_while(|(a, b)| a == b)
                    .count();
                if shared > best_shared {
                    best_shared = shared;
                    best = candidate.as_ref();
                }
            }
            Some(best)
        }
    }
}

/// Compares two paths that may use different separators.
pub fn same_path_ignoring_separators(first: &str, second: &str) -> bool {
    let first_sep = find_path_separator(first);
    let second_sep = find_path_separator(second);
    if first_sep == second_sep {
        return first == second;
    }
    second
        .split(second_sep)
        .collect::<Vec<_>>()
        .join(&first_sep.to_string())
        == first
}

/// Builds the ordered rule list for a session.
///
/// When `remote_path` is set, the trailing segments it shares with
/// `local_root` (stopping at a `src` segment) are stripped and the remaining
/// prefixes become the first rule. User `substitutePath` entries follow.
/// Returns the rules and the remote separator they imply.
pub fn derive_rules(
    local_root: &str,
    remote_path: &str,
    substitute_path: &[SubstitutePath],
) -> (Vec<PathRule>, Option<char>) {
    let mut rules = Vec::new();
    let mut remote_separator = None;

    if !remote_path.is_empty() {
        let local_sep = find_path_separator(local_root);
        let remote_sep = find_path_separator(remote_path);
        remote_separator = Some(remote_sep);

        let local: Vec<&str> = segments(local_root).collect();
        let remote: Vec<&str> = segments(remote_path).collect();
        let shared = local
            .iter()
            .rev()
            .zip(remote.iter().rev())
            .take_while(|(l, r)| l == r && **l != "src")
            .count();

        let (from, to) = if shared > 0 {
            let from = local[..local.len() - shared].join(&local_sep.to_string());
            let to = remote[..remote.len().saturating_sub(shared)].join(&remote_sep.to_string());
            (format!("{from}{local_sep}"), format!("{to}{remote_sep}"))
        } else if remote_path.len() > 1 && remote_path.ends_with(['/', '\\']) {
            (
                local_root.to_string(),
                remote_path[..remote_path.len() - 1].to_string(),
            )
        } else {
            (local_root.to_string(), remote_path.to_string())
        };

        rules.push(PathRule {
            from: normalize_separators(&from),
            to: normalize_separators(&to),
        });
    }

    for entry in substitute_path {
        if remote_separator.is_none() {
            remote_separator = Some(find_path_separator(&entry.to));
        }
        rules.push(PathRule {
            from: normalize_separators(&entry.from),
            to: normalize_separators(&entry.to),
        });
    }

    (rules, remote_separator)
}

/// Makes relative `file.go:line:` references in backend output absolute.
pub fn expand_file_path_in_output(text: &str, cwd: &Path) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\s*(\S+\.go):(\d+):").expect("valid regex"));

    text.split('\n')
        .map(|line| {
            let Some(file) = re.captures(line).and_then(|caps| caps.get(1)) else {
                return line.to_string();
            };
            let file = file.as_str();
            if Path::new(file).is_absolute() {
                return line.to_string();
            }
            line.replacen(file, &cwd.join(file).to_string_lossy(), 1)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_module_version(path: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"@v\d+\.\d+\.\d+[^/]*").expect("valid regex"));
    re.replace(path, "").into_owned()
}

/// Local Go installation roots used to place standard library and module
/// cache files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GoRoots {
    pub goroot: Option<PathBuf>,
    /// First entry of `GOPATH`.
    pub gopath: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct PathMapper {
    rules: Vec<PathRule>,
    remote_separator: char,
    local_separator: char,
    infer: bool,
    program_dir: PathBuf,
    roots: GoRoots,
    remote_loaded: bool,
    packages: Vec<PackageBuildInfo>,
    sources_by_name: HashMap<String, Vec<String>>,
    local_to_remote: HashMap<String, String>,
    remote_to_local: HashMap<String, String>,
}

impl PathMapper {
    /// A mapper that returns every path unchanged.
    pub fn passthrough() -> Self {
        Self {
            remote_separator: '/',
            local_separator: '/',
            ..Self::default()
        }
    }

    /// `program_dir` is the local directory used as the root for inferred
    /// paths (the program for launch, `cwd` for attach).
    pub fn new(
        rules: Vec<PathRule>,
        remote_separator: Option<char>,
        program_dir: PathBuf,
        roots: GoRoots,
    ) -> Self {
        let local_separator = find_path_separator(&program_dir.to_string_lossy());
        Self {
            rules,
            remote_separator: remote_separator.unwrap_or('/'),
            local_separator,
            program_dir,
            roots,
            ..Self::default()
        }
    }

    /// Enables inference from the backend's package and source lists when no
    /// explicit rules exist.
    pub fn with_inference(mut self, infer: bool) -> Self {
        self.infer = infer && self.rules.is_empty();
        self
    }

    /// `true` until [`PathMapper::set_remote_sources`] has been called in
    /// inference mode.
    pub fn needs_remote_sources(&self) -> bool {
        self.infer && !self.remote_loaded
    }

    /// Installs the backend's package list and source files. Sources whose
    /// name starts with `<` (`<autogenerated>`) are dropped.
    pub fn set_remote_sources(&mut self, packages: Vec<PackageBuildInfo>, sources: Vec<String>) {
        self.packages = packages;
        self.sources_by_name.clear();
        for source in sources.into_iter().filter(|s| !s.starts_with('<')) {
            self.sources_by_name
                .entry(base_name(&source).to_string())
                .or_default()
                .push(source);
        }
        self.remote_loaded = true;
    }

    pub fn to_backend_path(&mut self, local: &str) -> String {
        if self.rules.is_empty() {
            if self.infer {
                if let Some(remote) = self.infer_remote_path(local) {
                    return remote;
                }
            }
            return local.to_string();
        }

        let local = normalize_separators(local);
        let mut mapped = None;
        for rule in &self.rules {
            if !local.starts_with(&rule.from) {
                continue;
            }
            if mapped.is_some() {
                tracing::debug!(
                    target: "godap.paths",
                    from = %rule.from,
                    to = %rule.to,
                    path = %local,
                    "substitution rule also matches; keeping the first"
                );
                continue;
            }
            mapped = Some(format!("{}{}", rule.to, &local[rule.from.len()..]));
        }
        let mapped = mapped.unwrap_or(local);
        mapped.replace(['/', '\\'], &self.remote_separator.to_string())
    }

    pub fn to_local_path(&mut self, remote: &str) -> String {
        if self.rules.is_empty() {
            if self.infer {
                if let Some(local) = self.infer_local_path(remote) {
                    return local;
                }
            }
            return remote.to_string();
        }

        let remote = normalize_separators(remote);
        let mut mapped = None;
        for rule in &self.rules {
            if !remote.starts_with(&rule.to) {
                continue;
            }
            if mapped.is_some() {
                tracing::debug!(
                    target: "godap.paths",
                    from = %rule.from,
                    to = %rule.to,
                    path = %remote,
                    "substitution rule also matches; keeping the first"
                );
                continue;
            }
            mapped = Some(format!("{}{}", rule.from, &remote[rule.to.len()..]));
        }

        let Some(mapped) = mapped else {
            if let (Some(goroot), Some(index)) = (&self.roots.goroot, remote.find("/src/")) {
                if index > 0 {
                    return goroot.join(&remote[index + 1..]).to_string_lossy().into_owned();
                }
            }
            if let (Some(gopath), Some(index)) = (&self.roots.gopath, remote.find("/pkg/mod/")) {
                if index > 0 {
                    return gopath.join(&remote[index + 1..]).to_string_lossy().into_owned();
                }
            }
            return remote.replace('/', &self.local_separator.to_string());
        };
        mapped.replace('/', &self.local_separator.to_string())
    }

    fn infer_remote_path(&mut self, local: &str) -> Option<String> {
        if let Some(hit) = self.local_to_remote.get(local) {
            return Some(hit.clone());
        }
        let candidates = self.sources_by_name.get(base_name(local))?;
        let remote = find_path_with_best_matching_suffix(local, candidates)?.to_string();
        self.local_to_remote.insert(local.to_string(), remote.clone());
        Some(remote)
    }

    fn infer_local_path(&mut self, remote: &str) -> Option<String> {
        if remote.is_empty() {
            return Some(String::new());
        }
        if let Some(hit) = self.remote_to_local.get(remote) {
            return Some(hit.clone());
        }

        let local = self
            .infer_local_path_from_package(remote)
            .or_else(|| self.infer_local_path_from_program_dir(remote))?;
        let local = local.to_string_lossy().into_owned();
        self.remote_to_local.insert(remote.to_string(), local.clone());
        Some(local)
    }

    fn infer_local_path_from_package(&self, remote: &str) -> Option<PathBuf> {
        let package = self
            .packages
            .iter()
            .find(|pkg| remote.starts_with(&pkg.directory_path))?;
        let remote_sep = find_path_separator(&package.directory_path);
        let local_sep = self.local_separator.to_string();

        // Delve does not always report module cache paths escaped.
        let remote = escape_go_module_path(remote);
        let import_path = escape_go_module_path(&package.import_path);
        let index = strip_module_version(&remote).find(&import_path)?;

        let relative = remote
            .get(index..)?
            .split(remote_sep)
            .collect::<Vec<_>>()
            .join(&local_sep);
        let with_local_sep = remote.split(remote_sep).collect::<Vec<_>>().join(&local_sep);

        let in_program = self.program_dir.join(&relative);
        if in_program.exists() {
            return Some(in_program);
        }

        if let Some(gopath) = &self.roots.gopath {
            let module_cache = match with_local_sep.find("/pkg/mod/") {
                Some(index) => gopath.join(&with_local_sep[index + 1..]),
                None => gopath.join("pkg").join("mod").join(&relative),
            };
            if module_cache.exists() {
                return Some(module_cache);
            }
            let gopath_src = gopath.join("src").join(&relative);
            if gopath_src.exists() {
                return Some(gopath_src);
            }
        }

        if let Some(goroot) = &self.roots.goroot {
            let in_goroot = match with_local_sep.find("/src/") {
                Some(index) => goroot.join(&with_local_sep[index + 1..]),
                None => goroot.join("src").join(&relative),
            };
            if in_goroot.exists() {
                return Some(in_goroot);
            }
        }

        None
    }

    /// Last resort: a file with the same name somewhere under the program
    /// directory.
    fn infer_local_path_from_program_dir(&self, remote: &str) -> Option<PathBuf> {
        let name = base_name(remote);
        let candidates: Vec<String> = WalkDir::new(&self.program_dir)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file() && entry.file_name() == name)
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.program_dir)
                    .ok()
                    .map(|rel| rel.to_string_lossy().into_owned())
            })
            .collect();
        let best = find_path_with_best_matching_suffix(remote, &candidates)?;
        Some(self.program_dir.join(best))
    }
}
