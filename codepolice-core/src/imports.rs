//! Import-declaration scanning for analysis-context building.
//!
//! The repository monitor fetches each changed file and follows its
//! import/require/include declarations up to depth 2. Scanning is plain
//! line-based parsing per language; a declaration that cannot be resolved to
//! a repository path is silently skipped. The closure is best-effort context
//! for the analyzer, not a build system.

/// Languages with an import matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    JavaScript,
    Rust,
    Unknown,
}

/// Classify a file by extension.
pub fn language_of(path: &str) -> Language {
    match path.rsplit('.').next().unwrap_or_default() {
        "py" => Language::Python,
        "js" | "ts" | "jsx" | "tsx" | "mjs" => Language::JavaScript,
        "rs" => Language::Rust,
        _ => Language::Unknown,
    }
}

/// Extensions that are binary by definition; contents are never fetched.
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "ico", "pdf", "zip", "gz", "tar", "exe", "dll", "so", "dylib",
    "woff", "woff2", "ttf", "eot", "class", "jar", "wasm", "bin", "o", "a", "pyc",
];

/// Whether a file should be treated as binary: known binary extension, or a
/// NUL byte within the first 8 KiB of content.
pub fn is_probably_binary(path: &str, content: &[u8]) -> bool {
    let extension = path.rsplit('.').next().unwrap_or_default().to_lowercase();
    if BINARY_EXTENSIONS.contains(&extension.as_str()) {
        return true;
    }
    content[..content.len().min(8192)].contains(&0)
}

/// Scan one file's content and return repository-path candidates for every
/// import declaration found.
///
/// Each declaration may map to several candidate paths (e.g. `a.b` may be
/// `a/b.py` or `a/b/__init__.py`); the monitor tries them in order and takes
/// the first that exists at the commit.
pub fn scan_imports(path: &str, content: &str) -> Vec<Vec<String>> {
    match language_of(path) {
        Language::Python => scan_python(path, content),
        Language::JavaScript => scan_javascript(path, content),
        Language::Rust => scan_rust(path, content),
        Language::Unknown => Vec::new(),
    }
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn join(dir: &str, rest: &str) -> String {
    if dir.is_empty() {
        rest.to_string()
    } else {
        format!("{dir}/{rest}")
    }
}

fn scan_python(path: &str, content: &str) -> Vec<Vec<String>> {
    let dir = parent_dir(path);
    let mut out = Vec::new();

    for line in content.lines() {
        let line = line.trim_start();
        let module = if let Some(rest) = line.strip_prefix("import ") {
            // `import a.b as c, d` — take the first module.
            rest.split([' ', ',']).next().unwrap_or_default().to_string()
        } else if let Some(rest) = line.strip_prefix("from ") {
            match rest.split_whitespace().next() {
                Some(module) => module.to_string(),
                None => continue,
            }
        } else {
            continue;
        };
        if module.is_empty() {
            continue;
        }

        let candidates = if let Some(relative) = module.strip_prefix('.') {
            // Relative import: resolve against the importing file's package.
            let sub = relative.trim_start_matches('.').replace('.', "/");
            if sub.is_empty() {
                continue;
            }
            vec![
                join(dir, &format!("{sub}.py")),
                join(dir, &format!("{sub}/__init__.py")),
            ]
        } else {
            let base = module.replace('.', "/");
            vec![format!("{base}.py"), format!("{base}/__init__.py")]
        };
        out.push(candidates);
    }
    out
}

fn scan_javascript(path: &str, content: &str) -> Vec<Vec<String>> {
    let dir = parent_dir(path);
    let mut out = Vec::new();

    for line in content.lines() {
        let line = line.trim_start();
        let specifier = extract_js_specifier(line);
        let Some(specifier) = specifier else { continue };

        // Only relative specifiers resolve inside the repository; bare
        // specifiers are packages.
        if !specifier.starts_with("./") && !specifier.starts_with("../") {
            continue;
        }
        let Some(resolved) = normalize(&join(dir, &specifier)) else {
            continue;
        };

        let mut candidates = Vec::new();
        let has_extension = resolved
            .rsplit('/')
            .next()
            .is_some_and(|name| name.contains('.'));
        if has_extension {
            candidates.push(resolved.clone());
        } else {
            for ext in ["ts", "tsx", "js", "jsx", "mjs"] {
                candidates.push(format!("{resolved}.{ext}"));
            }
            for ext in ["ts", "js"] {
                candidates.push(format!("{resolved}/index.{ext}"));
            }
        }
        out.push(candidates);
    }
    out
}

fn extract_js_specifier(line: &str) -> Option<String> {
    let after = if line.starts_with("import ") || line.starts_with("export ") {
        // `import x from './y'` or bare `import './y'`.
        match line.split_once(" from ") {
            Some((_, tail)) => tail,
            None => line.split_once(' ')?.1,
        }
    } else if let Some(idx) = line.find("require(") {
        &line[idx + "require(".len()..]
    } else {
        return None;
    };

    let after = after.trim_start();
    let quote = after.chars().next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }
    let rest = &after[1..];
    let end = rest.find(quote)?;
    Some(rest[..end].to_string())
}

fn scan_rust(path: &str, content: &str) -> Vec<Vec<String>> {
    let dir = parent_dir(path);
    let is_module_root = path.ends_with("/mod.rs")
        || path.ends_with("/lib.rs")
        || path.ends_with("/main.rs")
        || !path.contains('/');
    let mut out = Vec::new();

    for line in content.lines() {
        let line = line.trim_start();
        let rest = line
            .strip_prefix("pub mod ")
            .or_else(|| line.strip_prefix("mod "));
        let Some(rest) = rest else { continue };
        let Some(name) = rest.strip_suffix(';') else {
            // Inline `mod name { .. }` declares no file.
            continue;
        };
        let name = name.trim();
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            continue;
        }

        // `mod foo;` in lib.rs/main.rs/mod.rs resolves next to the file;
        // in foo.rs it resolves under foo/.
        let base = if is_module_root {
            dir.to_string()
        } else {
            let stem = path.rsplit('/').next().unwrap_or(path);
            let stem = stem.strip_suffix(".rs").unwrap_or(stem);
            join(dir, stem)
        };
        out.push(vec![
            join(&base, &format!("{name}.rs")),
            join(&base, &format!("{name}/mod.rs")),
        ]);
    }
    out
}

/// Collapse `.` and `..` segments; returns None if the path escapes the
/// repository root.
fn normalize(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_of() {
        assert_eq!(language_of("src/app.py"), Language::Python);
        assert_eq!(language_of("web/index.tsx"), Language::JavaScript);
        assert_eq!(language_of("src/lib.rs"), Language::Rust);
        assert_eq!(language_of("README.md"), Language::Unknown);
    }

    #[test]
    fn test_binary_detection() {
        assert!(is_probably_binary("logo.png", b"irrelevant"));
        assert!(is_probably_binary("blob", b"abc\0def"));
        assert!(!is_probably_binary("a.py", b"print('hi')\n"));
    }

    #[test]
    fn test_python_absolute_imports() {
        let content = "import os\nimport app.models\nfrom app.utils import helper\n";
        let imports = scan_imports("app/views.py", content);
        assert_eq!(imports.len(), 3);
        assert_eq!(imports[1], vec!["app/models.py", "app/models/__init__.py"]);
        assert_eq!(imports[2][0], "app/utils.py");
    }

    #[test]
    fn test_python_relative_import() {
        let imports = scan_imports("app/views.py", "from .models import User\n");
        assert_eq!(imports, vec![vec![
            "app/models.py".to_string(),
            "app/models/__init__.py".to_string(),
        ]]);
    }

    #[test]
    fn test_javascript_relative_imports_only() {
        let content = concat!(
            "import React from 'react';\n",
            "import { api } from './api';\n",
            "const db = require('../lib/db.js');\n",
        );
        let imports = scan_imports("src/components/App.jsx", content);
        assert_eq!(imports.len(), 2);
        assert!(imports[0].contains(&"src/components/api.ts".to_string()));
        assert!(imports[0].contains(&"src/components/api/index.js".to_string()));
        assert_eq!(imports[1], vec!["src/lib/db.js"]);
    }

    #[test]
    fn test_javascript_escape_above_root_is_skipped() {
        let imports = scan_imports("a.js", "import x from '../../outside';\n");
        assert!(imports.is_empty());
    }

    #[test]
    fn test_rust_mod_declarations() {
        let content = "pub mod retry;\nmod db;\nmod inline { }\n";
        let imports = scan_imports("server/src/lib.rs", content);
        assert_eq!(imports.len(), 2);
        assert_eq!(imports[0], vec!["server/src/retry.rs", "server/src/retry/mod.rs"]);
    }

    #[test]
    fn test_rust_mod_in_non_root_file() {
        let imports = scan_imports("src/pipeline.rs", "mod monitor;\n");
        assert_eq!(imports[0], vec![
            "src/pipeline/monitor.rs".to_string(),
            "src/pipeline/monitor/mod.rs".to_string(),
        ]);
    }

    #[test]
    fn test_unknown_language_has_no_imports() {
        assert!(scan_imports("notes.txt", "import nothing\n").is_empty());
    }
}
