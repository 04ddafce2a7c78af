//! Plugin import injection
//!
//! Plugins register themselves into the core through side-effect-only
//! imports (`_ "package/path"`) in the core's entry-point source file.
//! This module rewrites that file to add the imports for a build.
//!
//! The rewrite is scoped to the import declarations: the file is scanned
//! with a comment- and string-aware pass, the new entry is spliced into
//! the existing import block (or a new declaration is added after the
//! package clause), and every other byte is left untouched. The result
//! is staged in memory before anything is written, so a failed rewrite
//! can never leave a truncated source file on disk. Injecting an import
//! that is already present leaves the file bit-identical.

use crate::error::{SmithError, SmithResult};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// The local binding used for side-effect-only imports
const DISCARD: &str = "_";

/// Add side-effect imports for `packages` to the entry-point file at
/// `entrypoint`, writing the result back with mode 0660. Imports that
/// are already present are skipped; if nothing is missing the file is
/// not rewritten at all.
pub fn inject_imports(entrypoint: &Path, packages: &[&str]) -> SmithResult<()> {
    let source = fs::read_to_string(entrypoint)
        .map_err(|e| SmithError::io(format!("reading {}", entrypoint.display()), e))?;

    let Some(updated) = add_blank_imports(&source, packages)? else {
        return Ok(());
    };

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(entrypoint)
        .map_err(|e| SmithError::io(format!("saving {}", entrypoint.display()), e))?;
    file.set_permissions(fs::Permissions::from_mode(0o660))
        .map_err(|e| SmithError::io(format!("chmod {}", entrypoint.display()), e))?;
    file.write_all(updated.as_bytes())
        .map_err(|e| SmithError::io(format!("saving {}", entrypoint.display()), e))?;
    Ok(())
}

/// Compute the rewritten source with `_ "pkg"` imports added for every
/// package not already imported with the discarded name. Returns `None`
/// when the source already contains all requested imports.
pub fn add_blank_imports(source: &str, packages: &[&str]) -> SmithResult<Option<String>> {
    let mut current = source.to_string();
    let mut changed = false;
    for pkg in packages {
        if let Some(next) = add_one(&current, pkg)? {
            current = next;
            changed = true;
        }
    }
    Ok(changed.then_some(current))
}

fn add_one(source: &str, pkg: &str) -> SmithResult<Option<String>> {
    let lines: Vec<&str> = source.split_inclusive('\n').collect();
    let scan = scan(&lines);

    if scan.blank_imports.iter().any(|p| p == pkg) {
        return Ok(None);
    }

    let mut out = String::with_capacity(source.len() + pkg.len() + 16);

    if let Some(block) = scan.import_blocks.first() {
        if block.close_line == block.open_line {
            // one-line declaration: entries are semicolon-separated
            for (i, line) in lines.iter().enumerate() {
                if i == block.open_line {
                    let close = line.rfind(')').expect("scanned block has a closer");
                    out.push_str(&line[..close]);
                    out.push_str(&format!("; {DISCARD} \"{pkg}\""));
                    out.push_str(&line[close..]);
                } else {
                    out.push_str(line);
                }
            }
        } else {
            for (i, line) in lines.iter().enumerate() {
                if i == block.close_line {
                    out.push_str(&format!("\t{DISCARD} \"{pkg}\"\n"));
                }
                out.push_str(line);
            }
        }
        return Ok(Some(out));
    }

    if let Some(last) = scan.single_import_lines.last() {
        for (i, line) in lines.iter().enumerate() {
            out.push_str(line);
            if i == *last {
                out.push_str(&format!("import {DISCARD} \"{pkg}\"\n"));
            }
        }
        return Ok(Some(out));
    }

    let Some(package_line) = scan.package_line else {
        return Err(SmithError::Internal(format!(
            "entry point has no package clause; cannot inject {pkg}"
        )));
    };
    for (i, line) in lines.iter().enumerate() {
        out.push_str(line);
        if i == package_line {
            out.push_str(&format!("\nimport {DISCARD} \"{pkg}\"\n"));
        }
    }
    Ok(Some(out))
}

#[derive(Debug, Default)]
struct Scan {
    package_line: Option<usize>,
    import_blocks: Vec<ImportBlock>,
    single_import_lines: Vec<usize>,
    /// paths already imported with the discarded name
    blank_imports: Vec<String>,
}

#[derive(Debug)]
struct ImportBlock {
    open_line: usize,
    close_line: usize,
}

fn scan(lines: &[&str]) -> Scan {
    let mut result = Scan::default();
    let mut state = LexState::Code;
    let mut open_block: Option<usize> = None;

    for (i, raw) in lines.iter().enumerate() {
        let (code, next_state) = effective_code(raw, state);
        let carried = state;
        state = next_state;
        if matches!(carried, LexState::BlockComment | LexState::RawString) && code.trim().is_empty()
        {
            continue;
        }
        let trimmed = code.trim();

        if let Some(open) = open_block {
            collect_entries(trimmed, &mut result.blank_imports);
            if trimmed == ")" || trimmed.starts_with(')') {
                result.import_blocks.push(ImportBlock {
                    open_line: open,
                    close_line: i,
                });
                open_block = None;
            }
            continue;
        }

        if result.package_line.is_none() && trimmed.starts_with("package ") {
            result.package_line = Some(i);
            continue;
        }

        if is_import_decl(trimmed) {
            let rest = trimmed["import".len()..].trim_start();
            if let Some(inner) = rest.strip_prefix('(') {
                if inner.contains(')') {
                    // entries and closer on the same line
                    let inner = &inner[..inner.rfind(')').unwrap()];
                    for entry in inner.split(';') {
                        collect_entries(entry.trim(), &mut result.blank_imports);
                    }
                    result.import_blocks.push(ImportBlock {
                        open_line: i,
                        close_line: i,
                    });
                } else {
                    collect_entries(inner.trim(), &mut result.blank_imports);
                    open_block = Some(i);
                }
            } else if !rest.is_empty() {
                collect_entries(rest, &mut result.blank_imports);
                result.single_import_lines.push(i);
            }
        }
    }

    // unterminated block: treat the opener as a single import so we never
    // splice relative to a closer that does not exist
    if let Some(open) = open_block {
        result.single_import_lines.push(open);
    }

    result
}

/// True when `line` begins an import declaration (and is not merely an
/// identifier that happens to start with "import")
fn is_import_decl(line: &str) -> bool {
    match line.strip_prefix("import") {
        Some(rest) => rest.starts_with(' ') || rest.starts_with('\t') || rest.starts_with('('),
        None => false,
    }
}

/// Record `entry`'s path if it is a discarded-name import
fn collect_entries(entry: &str, blank: &mut Vec<String>) {
    let entry = entry.trim();
    let Some(rest) = entry.strip_prefix(DISCARD) else {
        return;
    };
    let rest = rest.trim_start();
    if let Some(path) = quoted(rest) {
        blank.push(path.to_string());
    }
}

fn quoted(s: &str) -> Option<&str> {
    let s = s.strip_prefix('"')?;
    let end = s.find('"')?;
    Some(&s[..end])
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LexState {
    Code,
    BlockComment,
    RawString,
}

/// Strip comments from one line while preserving string literals,
/// carrying block-comment and raw-string state across lines.
fn effective_code(line: &str, state: LexState) -> (String, LexState) {
    let mut out = String::with_capacity(line.len());
    let mut state = state;
    let bytes = line.as_bytes();
    let mut i = 0;
    let mut in_string = false;

    while i < bytes.len() {
        let c = bytes[i];
        match state {
            LexState::BlockComment => {
                if c == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    state = LexState::Code;
                    i += 2;
                    continue;
                }
                i += 1;
            }
            LexState::RawString => {
                // raw string interiors are not code; drop them so text
                // like an import block inside a template is never scanned
                if c == b'`' {
                    out.push('`');
                    state = LexState::Code;
                }
                i += 1;
            }
            LexState::Code => {
                if in_string {
                    out.push(c as char);
                    if c == b'\\' && i + 1 < bytes.len() {
                        out.push(bytes[i + 1] as char);
                        i += 2;
                        continue;
                    }
                    if c == b'"' {
                        in_string = false;
                    }
                    i += 1;
                    continue;
                }
                match c {
                    b'"' => {
                        in_string = true;
                        out.push('"');
                        i += 1;
                    }
                    b'`' => {
                        state = LexState::RawString;
                        out.push('`');
                        i += 1;
                    }
                    b'/' if bytes.get(i + 1) == Some(&b'/') => break,
                    b'/' if bytes.get(i + 1) == Some(&b'*') => {
                        state = LexState::BlockComment;
                        i += 2;
                    }
                    _ => {
                        out.push(c as char);
                        i += 1;
                    }
                }
            }
        }
    }

    (out, state)
}
