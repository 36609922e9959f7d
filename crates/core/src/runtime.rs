//! Locate external runtime pieces: the ffmpeg/ffprobe binaries and the
//! ONNX Runtime dynamic library, preferring copies shipped next to the
//! executable over whatever is on PATH.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use tracing::{info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Probed in order:
///   1. `<exe_dir>/lib/`
///   2. `<exe_dir>/../lib/`
///   3. `<cwd>/lib/`
///   4. `/usr/local/lib/`, `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("bin"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        if !dirs.contains(&cwd) {
            dirs.push(cwd.clone());
        }
        let cwd_bin = cwd.join("bin");
        if !dirs.contains(&cwd_bin) {
            dirs.push(cwd_bin);
        }
    }
    dirs
}

#[cfg(unix)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    vec![binary.to_string()]
}

#[cfg(windows)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    if Path::new(binary).components().count() > 1 {
        return vec![binary.to_string()];
    }
    let lower = binary.to_ascii_lowercase();
    if lower.ends_with(".exe") || lower.ends_with(".cmd") || lower.ends_with(".bat") {
        return vec![binary.to_string()];
    }
    vec![
        format!("{binary}.exe"),
        format!("{binary}.cmd"),
        format!("{binary}.bat"),
        binary.to_string(),
    ]
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = candidate_binary_names(binary);
    for dir in dirs {
        for name in &names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// A `Command` for `binary`, resolved against the candidate directories
/// first so a bundled ffmpeg wins over the system one. Falls back to PATH
/// resolution when no bundled copy exists.
pub fn command_for(binary: &str) -> ProcessCommand {
    if let Some(path) = find_binary_in_dirs(binary, &candidate_bin_dirs()) {
        return ProcessCommand::new(path);
    }
    ProcessCommand::new(binary)
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    for dir in dirs {
        let candidate = dir.join(ORT_LIB_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Point ORT at a bundled runtime library, if one exists and the user has
/// not already chosen one. Call at the very start of `main()`, before any
/// session is built.
pub fn setup_runtime_libs() {
    if env::var_os("ORT_DYLIB_PATH").is_none() {
        if let Some(path) = find_ort_dylib_in_dirs(&candidate_lib_dirs()) {
            env::set_var("ORT_DYLIB_PATH", &path);
        }
    }
}

/// Log which runtime library was resolved. Call after tracing is up.
pub fn log_runtime_lib_status() {
    if let Ok(ort) = env::var("ORT_DYLIB_PATH") {
        if Path::new(&ort).is_file() {
            info!("ORT library: {ort}");
        } else {
            warn!("ORT_DYLIB_PATH set to {ort} but file not found");
        }
    } else {
        warn!("ORT_DYLIB_PATH not set — ORT will try default search paths");
    }
}
