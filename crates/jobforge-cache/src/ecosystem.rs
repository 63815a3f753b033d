//! Default cache locations per project ecosystem.
//!
//! The table is static. Detection maps the manifest files a job declares to
//! the ecosystems they belong to; it never inspects the workspace itself.

use std::path::Path;

/// A project ecosystem and where it keeps its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ecosystem {
    pub name: &'static str,
    /// File names that identify the ecosystem.
    pub manifests: &'static [&'static str],
    /// Directories worth caching. Relative paths resolve against the checkout.
    pub paths: &'static [&'static str],
}

pub const ECOSYSTEMS: &[Ecosystem] = &[
    Ecosystem {
        name: "node",
        manifests: &[
            "package.json",
            "package-lock.json",
            "yarn.lock",
            "pnpm-lock.yaml",
        ],
        paths: &["node_modules", "~/.npm"],
    },
    Ecosystem {
        name: "rust",
        manifests: &["Cargo.toml", "Cargo.lock"],
        paths: &["target", "~/.cargo/registry", "~/.cargo/git"],
    },
    Ecosystem {
        name: "python",
        manifests: &[
            "requirements.txt",
            "Pipfile.lock",
            "poetry.lock",
            "pyproject.toml",
        ],
        paths: &[".venv", "~/.cache/pip"],
    },
    Ecosystem {
        name: "go",
        manifests: &["go.mod", "go.sum"],
        paths: &["~/go/pkg/mod"],
    },
    Ecosystem {
        name: "ruby",
        manifests: &["Gemfile", "Gemfile.lock"],
        paths: &["vendor/bundle"],
    },
    Ecosystem {
        name: "maven",
        manifests: &["pom.xml"],
        paths: &["~/.m2/repository"],
    },
    Ecosystem {
        name: "gradle",
        manifests: &["build.gradle", "build.gradle.kts", "gradle.lockfile"],
        paths: &["~/.gradle/caches"],
    },
];

/// Ecosystems identified by the given manifest paths, in table order.
pub fn detect_ecosystems<S: AsRef<str>>(manifests: &[S]) -> Vec<&'static Ecosystem> {
    let names: Vec<&str> = manifests
        .iter()
        .filter_map(|m| Path::new(m.as_ref()).file_name()?.to_str())
        .collect();

    ECOSYSTEMS
        .iter()
        .filter(|eco| eco.manifests.iter().any(|m| names.contains(m)))
        .collect()
}

/// Cache paths for the ecosystems identified by `manifests`.
///
/// Ordered and deduplicated. Empty when nothing matches.
pub fn detect_cache_paths<S: AsRef<str>>(manifests: &[S]) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for eco in detect_ecosystems(manifests) {
        for path in eco.paths {
            if !paths.iter().any(|p| p == path) {
                paths.push(path.to_string());
            }
        }
    }
    paths
}

/// Union of every ecosystem's defaults.
pub fn all_default_paths() -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for path in ECOSYSTEMS.iter().flat_map(|e| e.paths.iter()) {
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_string());
        }
    }
    paths
}
