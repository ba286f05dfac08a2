//! Inference engine build target and output verification.
//!
//! Build success is decided by the filesystem, never by the exit status of
//! the build command: candidate output paths are probed in declared order,
//! then the checkout is searched recursively for the output file name.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// How the fallback CMake configure selects a compiler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CompilerSelection {
    /// Generator toolset (`-T ClangCL` on Visual Studio generators)
    Toolset { name: String },

    /// Explicit C/C++ compiler executables
    Compilers { c: String, cxx: String },
}

impl CompilerSelection {
    /// Default selection for the host: the engine needs clang, not MSVC/gcc
    pub fn host_default() -> Self {
        if cfg!(windows) {
            Self::Toolset {
                name: "ClangCL".to_string(),
            }
        } else {
            Self::Compilers {
                c: "clang".to_string(),
                cxx: "clang++".to_string(),
            }
        }
    }

    /// Arguments for `cmake -B build ...`
    pub fn cmake_args(&self) -> Vec<String> {
        match self {
            Self::Toolset { name } => vec!["-T".to_string(), name.clone()],
            Self::Compilers { c, cxx } => vec![
                format!("-DCMAKE_C_COMPILER={}", c),
                format!("-DCMAKE_CXX_COMPILER={}", cxx),
            ],
        }
    }
}

/// The inference engine build
#[derive(Debug, Clone)]
pub struct BuildTarget {
    /// Source repository
    pub repo_url: String,

    /// Local checkout
    pub checkout_path: PathBuf,

    /// Vendor setup script, relative to the checkout
    pub primary_entry_point: String,

    /// Model identifier passed to the setup script
    pub model_repo: String,

    /// Quantization type passed to the setup script
    pub quantization: String,

    /// Compiler for the manual CMake path
    pub fallback_compiler: CompilerSelection,

    /// Candidate output paths relative to the checkout, in priority order
    pub expected_outputs: Vec<PathBuf>,

    /// File name of the build output (`llama-server[.exe]`)
    pub output_file_name: String,

    /// Absolute path the backend runs the output from
    pub installed_output: PathBuf,

    /// Canonical location for the model the setup script produces
    pub model_destination: PathBuf,
}

impl BuildTarget {
    pub fn entry_point_path(&self) -> PathBuf {
        self.checkout_path.join(&self.primary_entry_point)
    }

    pub fn build_dir(&self) -> PathBuf {
        self.checkout_path.join("build")
    }

    /// Declared candidates only; no recursive search
    pub fn probe(&self) -> Option<Located> {
        probe_candidates(&self.checkout_path, &self.expected_outputs)
    }

    /// Candidates, then a recursive search of the checkout
    pub fn locate(&self) -> Option<Located> {
        locate_output(
            &self.checkout_path,
            &self.expected_outputs,
            &self.output_file_name,
        )
    }
}

/// Where a build output was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located {
    /// One of the declared candidates (index into the candidate list)
    Candidate { index: usize, path: PathBuf },

    /// Found by recursive search
    Searched { path: PathBuf },
}

impl Located {
    pub fn path(&self) -> &Path {
        match self {
            Self::Candidate { path, .. } | Self::Searched { path } => path,
        }
    }
}

/// Terminal state of a successful build orchestration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Output already existed; nothing was done
    Satisfied(Located),

    /// Output produced by this run
    Built(Located),
}

impl BuildOutcome {
    pub fn located(&self) -> &Located {
        match self {
            Self::Satisfied(l) | Self::Built(l) => l,
        }
    }
}

/// First existing candidate, in declared order
pub fn probe_candidates(root: &Path, candidates: &[PathBuf]) -> Option<Located> {
    candidates.iter().enumerate().find_map(|(index, candidate)| {
        let path = root.join(candidate);
        path.is_file().then_some(Located::Candidate { index, path })
    })
}

/// Probe candidates in order, then search `root` for `file_name`
pub fn locate_output(root: &Path, candidates: &[PathBuf], file_name: &str) -> Option<Located> {
    probe_candidates(root, candidates)
        .or_else(|| search_for_file(root, file_name).map(|path| Located::Searched { path }))
}

/// Recursive search for a file name under `root`
pub fn search_for_file(root: &Path, file_name: &str) -> Option<PathBuf> {
    if !root.is_dir() {
        return None;
    }

    let pattern = format!(
        "{}/**/{}",
        glob::Pattern::escape(&root.to_string_lossy()),
        glob::Pattern::escape(file_name)
    );

    glob::glob(&pattern)
        .ok()?
        .filter_map(Result::ok)
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"bin").unwrap();
    }

    #[test]
    fn test_cmake_args() {
        let toolset = CompilerSelection::Toolset {
            name: "ClangCL".to_string(),
        };
        assert_eq!(toolset.cmake_args(), vec!["-T", "ClangCL"]);

        let compilers = CompilerSelection::Compilers {
            c: "clang".to_string(),
            cxx: "clang++".to_string(),
        };
        assert_eq!(
            compilers.cmake_args(),
            vec!["-DCMAKE_C_COMPILER=clang", "-DCMAKE_CXX_COMPILER=clang++"]
        );
    }

    #[test]
    fn test_first_existing_candidate_wins() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("a/llama-server"));
        touch(&temp.path().join("b/llama-server"));

        let candidates = vec![PathBuf::from("a/llama-server"), PathBuf::from("b/llama-server")];
        let found = locate_output(temp.path(), &candidates, "llama-server").unwrap();
        assert_eq!(
            found,
            Located::Candidate {
                index: 0,
                path: temp.path().join("a/llama-server")
            }
        );
    }

    #[test]
    fn test_search_ignores_directories_with_output_name() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("x/llama-server")).unwrap();
        assert!(search_for_file(temp.path(), "llama-server").is_none());
    }

    #[test]
    fn test_missing_root() {
        let temp = TempDir::new().unwrap();
        assert!(locate_output(&temp.path().join("nope"), &[], "llama-server").is_none());
    }
}
