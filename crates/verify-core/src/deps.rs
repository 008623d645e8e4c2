//! Python dependency detection: imports in source, missing modules in stderr.

use crate::static_regex;
use regex::Regex;
use std::sync::LazyLock;

static IMPORT: LazyLock<Regex> =
    LazyLock::new(|| static_regex(r"(?m)^\s*(?:import|from)\s+(\w+)"));
static NO_MODULE: LazyLock<Regex> =
    LazyLock::new(|| static_regex(r#"No module named ['"]?([\w.]+)['"]?"#));

/// Top-level stdlib modules never reported as missing.
const STDLIB: &[&str] = &[
    "os", "sys", "re", "math", "json", "csv", "time", "datetime", "pathlib", "subprocess",
    "shutil", "collections", "itertools", "functools", "typing", "io", "string", "random",
    "copy", "argparse", "logging", "unittest", "dataclasses", "abc", "contextlib", "traceback",
    "threading", "multiprocessing", "socket", "http", "urllib", "hashlib", "base64", "struct",
    "array", "bisect", "heapq", "statistics", "decimal", "fractions", "enum", "textwrap",
    "pprint", "tempfile", "glob", "fnmatch", "pickle", "shelve", "sqlite3", "xml", "html",
    "email", "configparser", "platform", "signal", "ctypes", "inspect", "ast", "dis", "code",
    "codeop", "operator", "weakref", "asyncio", "queue", "select", "selectors", "uuid", "zlib",
    "gzip", "zipfile", "tarfile", "getpass", "secrets", "errno", "stat", "atexit", "builtins",
    "__future__",
];

/// Import names whose pip package has a different name.
const PACKAGE_NAMES: &[(&str, &str)] = &[
    ("cv2", "opencv-python"),
    ("PIL", "pillow"),
    ("yaml", "pyyaml"),
    ("sklearn", "scikit-learn"),
    ("serial", "pyserial"),
    ("bs4", "beautifulsoup4"),
    ("dateutil", "python-dateutil"),
    ("RPi", "RPi.GPIO"),
    ("usb", "pyusb"),
    ("can", "python-can"),
];

pub fn is_stdlib(module: &str) -> bool {
    STDLIB.contains(&module)
}

/// Non-stdlib top-level modules imported by `code`, in order of appearance.
pub fn third_party_imports(code: &str) -> Vec<String> {
    let mut modules: Vec<String> = Vec::new();
    for caps in IMPORT.captures_iter(code) {
        let module = &caps[1];
        if is_stdlib(module) || modules.iter().any(|m| m == module) {
            continue;
        }
        modules.push(module.to_string());
    }
    modules
}

/// Modules named by `ModuleNotFoundError` / `ImportError` lines in stderr.
pub fn missing_modules(stderr: &str) -> Vec<String> {
    let mut modules: Vec<String> = Vec::new();
    for caps in NO_MODULE.captures_iter(stderr) {
        let top = caps[1].split('.').next().unwrap_or_default();
        if top.is_empty() || is_stdlib(top) || modules.iter().any(|m| m == top) {
            continue;
        }
        modules.push(top.to_string());
    }
    modules
}

/// Pip package providing an importable module.
pub fn package_for(module: &str) -> String {
    PACKAGE_NAMES
        .iter()
        .find(|(m, _)| *m == module)
        .map_or_else(|| module.to_string(), |(_, pkg)| (*pkg).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_missing_module_in_traceback() {
        let stderr = "Traceback (most recent call last):\n  File \"x.py\", line 1, in <module>\n    import numpy.linalg\nModuleNotFoundError: No module named 'numpy'\n";
        assert_eq!(missing_modules(stderr), vec!["numpy"]);
    }

    #[test]
    fn dotted_names_reduce_to_top_level() {
        assert_eq!(
            missing_modules("ImportError: No module named 'google.protobuf'"),
            vec!["google"]
        );
    }

    #[test]
    fn clean_stderr_has_no_missing_modules() {
        assert!(missing_modules("ValueError: bad input").is_empty());
    }

    #[test]
    fn third_party_imports_skip_stdlib() {
        let code = "import os\nimport requests\nfrom bs4 import BeautifulSoup\nimport requests\n";
        assert_eq!(third_party_imports(code), vec!["requests", "bs4"]);
    }

    #[test]
    fn package_names_are_mapped() {
        assert_eq!(package_for("cv2"), "opencv-python");
        assert_eq!(package_for("requests"), "requests");
    }
}
