// Source inspection helpers used during project analysis.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use walkdir::DirEntry;

pub const META_DIR: &str = ".wheelhouse";

pub const PRIORITY_TOP: u8 = 0;
pub const PRIORITY_LIKELY: u8 = 1;
pub const PRIORITY_LAST: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framework {
    Flask,
    FastApi,
    Plain,
}

// Checks if the file contains a python main.
pub fn check_python_main(code: &str) -> bool {
    code.contains("if __name__ == \"__main__\":") || code.contains("if __name__ == '__main__':")
}

/// Detects the web framework a module instantiates, with the variable holding the app.
pub fn detect_framework(code: &str) -> (Framework, Option<String>) {
    static FASTAPI: OnceLock<Regex> = OnceLock::new();
    static FLASK: OnceLock<Regex> = OnceLock::new();
    let fastapi = FASTAPI
        .get_or_init(|| Regex::new(r"(?m)^([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(?:fastapi\.)?FastAPI\(").expect("valid regex"));
    let flask = FLASK
        .get_or_init(|| Regex::new(r"(?m)^([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(?:flask\.)?Flask\(").expect("valid regex"));

    if let Some(caps) = fastapi.captures(code) {
        return (Framework::FastApi, Some(caps[1].to_string()));
    }
    if let Some(caps) = flask.captures(code) {
        return (Framework::Flask, Some(caps[1].to_string()));
    }
    (Framework::Plain, None)
}

/// A literal port passed to the app's `run(...)` call, e.g. `app.run(port=5000)`.
pub fn hardcoded_port(code: &str) -> Option<u16> {
    static PORT: OnceLock<Regex> = OnceLock::new();
    let re = PORT.get_or_init(|| Regex::new(r"\.run\([^)]*\bport\s*=\s*(\d+)").expect("valid regex"));
    re.captures(code)?.get(1)?.as_str().parse().ok()
}

pub fn python_priority(framework: Framework, code: &str) -> u8 {
    match framework {
        Framework::Flask | Framework::FastApi => PRIORITY_TOP,
        Framework::Plain if check_python_main(code) => PRIORITY_LIKELY,
        Framework::Plain => PRIORITY_LAST,
    }
}

pub fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

pub fn ignore_dir(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| {
            s.starts_with("node_modules")
                || s.starts_with("__pycache__")
                || s == "venv"
                || s.ends_with(".egg-info")
        })
        .unwrap_or(false)
}

/// A directory counts as an internal package when it has `__init__.py` or `__main__.py`.
pub fn is_python_package(dir: &Path) -> bool {
    dir.join("__init__.py").is_file() || dir.join("__main__.py").is_file()
}

pub fn read_source(path: &Path) -> Result<String> {
    Ok(std::fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_hardcoded_port() {
        assert_eq!(
            hardcoded_port("if __name__ == '__main__':\n    app.run(host=\"0.0.0.0\", port=5000, debug=False)\n"),
            Some(5000)
        );
        assert_eq!(
            hardcoded_port("app.run(port=int(os.environ.get(\"PORT\", 8080)))"),
            None
        );
        assert_eq!(hardcoded_port("server_port = 5000"), None);
    }

    #[test]
    fn test_check_python_main_double_quotes() {
        let code = r#"
def main():
    print("Hello World")

if __name__ == "__main__":
    main()
"#;
        assert!(check_python_main(code));
    }

    #[test]
    fn test_check_python_main_single_quotes() {
        let code = "if __name__ == '__main__':\n    main()\n";
        assert!(check_python_main(code));
    }

    #[test]
    fn test_check_python_main_false() {
        assert!(!check_python_main("def some_function():\n    pass\n"));
    }

    #[test]
    fn test_detect_framework_fastapi() {
        let code = "from fastapi import FastAPI\n\napi = FastAPI()\n";
        assert_eq!(detect_framework(code), (Framework::FastApi, Some("api".to_string())));
    }

    #[test]
    fn test_detect_framework_flask() {
        let code = "from flask import Flask\napp = Flask(__name__)\n";
        assert_eq!(detect_framework(code), (Framework::Flask, Some("app".to_string())));
    }

    #[test]
    fn test_detect_framework_plain() {
        assert_eq!(detect_framework("print('hi')"), (Framework::Plain, None));
    }

    #[test]
    fn test_python_priority() {
        assert_eq!(python_priority(Framework::Flask, ""), PRIORITY_TOP);
        assert_eq!(
            python_priority(Framework::Plain, "if __name__ == '__main__':\n    run()"),
            PRIORITY_LIKELY
        );
        assert_eq!(python_priority(Framework::Plain, "x = 1"), PRIORITY_LAST);
    }

    #[test]
    fn test_is_python_package() {
        let temp_dir = TempDir::new().unwrap();
        let pkg = temp_dir.path().join("adms_wrapper");
        fs::create_dir(&pkg).unwrap();
        assert!(!is_python_package(&pkg));
        fs::write(pkg.join("__main__.py"), "").unwrap();
        assert!(is_python_package(&pkg));
    }
}
