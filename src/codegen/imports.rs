//! Import extraction and resolution for generated files.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::core::files::ImportRef;

const SCRIPT_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs"];

/// Path aliases commonly configured in the platform's tsconfig.
const ALIASES: &[(&str, &str)] = &[("@shared/", "shared/"), ("@/", "client/src/")];

fn script_imports() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?m)(?:^\s*import\s+(?:[^'"]*?\s+from\s+)?|^\s*export\s+[^'"]*?\s+from\s+|\brequire\(\s*|\bimport\(\s*)['"]([^'"]+)['"]"#,
        )
        .ok()
    })
    .as_ref()
}

fn python_imports() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(?:from\s+(\.*[\w.]*)\s+import\b|import\s+([\w.]+))").ok())
        .as_ref()
}

/// Module specifiers imported by `content`, in order of appearance.
pub fn extract_specifiers(language: &str, content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let captures: Vec<String> = match (language, script_imports(), python_imports()) {
        ("typescript" | "javascript", Some(re), _) => re
            .captures_iter(content)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect(),
        ("python", _, Some(re)) => re
            .captures_iter(content)
            .filter_map(|c| c.get(1).or_else(|| c.get(2)).map(|m| m.as_str().to_string()))
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    };
    captures.into_iter().filter(|s| seen.insert(s.clone())).collect()
}

/// Resolve every import in `content` against `known` repository paths.
pub fn resolve_imports(path: &str, language: &str, content: &str, known: &HashSet<String>) -> Vec<ImportRef> {
    extract_specifiers(language, content)
        .into_iter()
        .map(|spec| match language {
            "python" => resolve_python(path, &spec, known),
            _ => resolve_script(path, &spec, known),
        })
        .collect()
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Lexically join `base` and `rel`. `None` if it climbs above the root.
fn join(base: &str, rel: &str) -> Option<String> {
    let mut parts: Vec<&str> = base.split('/').filter(|p| !p.is_empty()).collect();
    for seg in rel.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            s => parts.push(s),
        }
    }
    Some(parts.join("/"))
}

fn first_known(candidates: impl IntoIterator<Item = String>, known: &HashSet<String>) -> Option<String> {
    candidates.into_iter().find(|c| known.contains(c))
}

fn script_candidates(base: &str) -> Vec<String> {
    let mut out = vec![base.to_string()];
    // `./foo.js` in TypeScript sources usually points at `foo.ts`.
    if let Some(stem) = base.strip_suffix(".js") {
        out.push(format!("{}.ts", stem));
        out.push(format!("{}.tsx", stem));
    }
    for ext in SCRIPT_EXTENSIONS {
        out.push(format!("{}.{}", base, ext));
    }
    for ext in SCRIPT_EXTENSIONS {
        out.push(format!("{}/index.{}", base, ext));
    }
    out
}

fn resolve_script(path: &str, spec: &str, known: &HashSet<String>) -> ImportRef {
    let base = if spec.starts_with("./") || spec.starts_with("../") {
        join(parent_dir(path), spec)
    } else if let Some((alias, target)) = ALIASES.iter().find(|(a, _)| spec.starts_with(a)) {
        let candidate = format!("{}{}", target, &spec[alias.len()..]);
        match first_known(script_candidates(&candidate), known) {
            Some(resolved) => {
                return ImportRef {
                    specifier: spec.to_string(),
                    resolved: Some(resolved),
                    external: false,
                }
            }
            None => None,
        }
    } else {
        None
    };

    match base {
        Some(base) => ImportRef {
            specifier: spec.to_string(),
            resolved: first_known(script_candidates(&base), known),
            external: false,
        },
        None => ImportRef {
            specifier: spec.to_string(),
            resolved: None,
            external: !(spec.starts_with('.') || spec.starts_with('/')),
        },
    }
}

fn resolve_python(path: &str, spec: &str, known: &HashSet<String>) -> ImportRef {
    let dots = spec.chars().take_while(|&c| c == '.').count();
    if dots == 0 {
        let module = spec.replace('.', "/");
        let resolved = first_known([format!("{}.py", module), format!("{}/__init__.py", module)], known);
        return ImportRef {
            specifier: spec.to_string(),
            external: resolved.is_none(),
            resolved,
        };
    }

    let mut base = Some(parent_dir(path).to_string());
    for _ in 1..dots {
        base = base.and_then(|b| join(&b, ".."));
    }
    let module = spec[dots..].replace('.', "/");
    let resolved = base.and_then(|b| {
        let target = if module.is_empty() {
            b.clone()
        } else {
            join(&b, &module)?
        };
        first_known(
            [format!("{}.py", target), format!("{}/__init__.py", target)],
            known,
        )
    });
    ImportRef {
        specifier: spec.to_string(),
        resolved,
        external: false,
    }
}
