//! Ent preprocessor
//!
//! Line-oriented textual pass run before lexing. Handles `#include` (with
//! header gating of the included file), `#define`/`#undef` macro rewriting,
//! and isolation of `asm { ... };` blocks into indexed opaque captures.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

/// One captured `asm { ... };` body, split into its raw lines.
#[derive(Debug, Clone, PartialEq)]
pub struct AsmBlock {
    pub lines: Vec<String>,
}

#[derive(Debug)]
pub struct PreprocessError {
    pub message: String,
}

impl PreprocessError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for PreprocessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PreprocessError {}

type Result<T> = std::result::Result<T, PreprocessError>;

pub struct Preprocessor {
    macros: IndexMap<String, String>,
    include_paths: Vec<PathBuf>,
    asm_blocks: Vec<AsmBlock>,
}

impl Preprocessor {
    pub fn new() -> Self {
        Self {
            macros: IndexMap::new(),
            include_paths: Vec::new(),
            asm_blocks: Vec::new(),
        }
    }

    pub fn add_include_path(&mut self, path: impl Into<PathBuf>) {
        self.include_paths.push(path.into());
    }

    /// Captured asm bodies, in encounter order. The i-th `asm;` marker in
    /// the output corresponds to the i-th entry.
    pub fn asm_blocks(&self) -> &[AsmBlock] {
        &self.asm_blocks
    }

    pub fn take_asm_blocks(&mut self) -> Vec<AsmBlock> {
        std::mem::take(&mut self.asm_blocks)
    }

    /// Run the full pass over `source`. `filename` is the path the source
    /// was read from; quoted includes resolve relative to its directory.
    pub fn process(&mut self, source: &str, filename: &str) -> Result<String> {
        let current_dir = Path::new(filename)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let mut output = String::new();
        let mut lines = source.lines();

        while let Some(line) = lines.next() {
            let trimmed = line.trim_start();
            if trimmed.is_empty() {
                continue;
            }

            if trimmed.starts_with('#') {
                self.process_directive(trimmed, &current_dir, &mut output)?;
                // keep line counts roughly stable
                output.push('\n');
            } else if is_asm_open(trimmed) {
                self.capture_asm(trimmed, &mut lines, &mut output)?;
            } else {
                output.push_str(&self.expand_macros(line));
                output.push('\n');
            }
        }

        Ok(output)
    }

    fn process_directive(
        &mut self,
        line: &str,
        current_dir: &Path,
        output: &mut String,
    ) -> Result<()> {
        let rest = line[1..].trim_start();

        if let Some(args) = rest.strip_prefix("include") {
            self.process_include(args.trim(), current_dir, output)
        } else if let Some(args) = rest.strip_prefix("define") {
            self.process_define(args.trim())
        } else if let Some(args) = rest.strip_prefix("undef") {
            self.process_undef(args.trim())
        } else {
            Err(PreprocessError::new(format!(
                "unknown preprocessor directive: {}",
                line
            )))
        }
    }

    fn process_define(&mut self, rest: &str) -> Result<()> {
        let name: String = rest
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if name.is_empty() {
            return Err(PreprocessError::new("expected macro name after #define"));
        }
        let value = rest[name.len()..].trim().to_string();
        self.macros.insert(name, value);
        Ok(())
    }

    fn process_undef(&mut self, rest: &str) -> Result<()> {
        let name = rest.trim();
        if name.is_empty() {
            return Err(PreprocessError::new("expected macro name after #undef"));
        }
        self.macros.shift_remove(name);
        Ok(())
    }

    fn process_include(
        &mut self,
        rest: &str,
        current_dir: &Path,
        output: &mut String,
    ) -> Result<()> {
        let (filename, quoted) = if let Some(inner) = rest.strip_prefix('"') {
            let end = inner
                .find('"')
                .ok_or_else(|| PreprocessError::new("unterminated include path"))?;
            (&inner[..end], true)
        } else if let Some(inner) = rest.strip_prefix('<') {
            let end = inner
                .find('>')
                .ok_or_else(|| PreprocessError::new("unterminated include path"))?;
            (&inner[..end], false)
        } else {
            return Err(PreprocessError::new(
                "expected \"path\" or <path> after #include",
            ));
        };

        let content = self.read_include(filename, current_dir, quoted)?;
        self.emit_header_content(&content, output)
    }

    fn read_include(&self, filename: &str, current_dir: &Path, quoted: bool) -> Result<String> {
        if quoted {
            let local = current_dir.join(filename);
            if local.exists() {
                return fs::read_to_string(&local).map_err(|e| {
                    PreprocessError::new(format!("cannot read {}: {}", local.display(), e))
                });
            }
        }
        for dir in &self.include_paths {
            let path = dir.join(filename);
            if path.exists() {
                return fs::read_to_string(&path).map_err(|e| {
                    PreprocessError::new(format!("cannot read {}: {}", path.display(), e))
                });
            }
        }
        Err(PreprocessError::new(format!(
            "cannot find include file: {}",
            filename
        )))
    }

    /// Emit only the body of the included file's top-level `header { ... };`
    /// block, wrapper stripped. Directive lines inside the block are
    /// executed; everything outside the block is discarded.
    fn emit_header_content(&mut self, content: &str, output: &mut String) -> Result<()> {
        let mut in_header = false;

        for line in content.lines() {
            let trimmed = line.trim_start();
            if !in_header {
                let after_kw = match trimmed.strip_prefix("header") {
                    Some(rest) => rest.trim_start(),
                    None => continue,
                };
                let inner = match after_kw.strip_prefix('{') {
                    Some(rest) => rest,
                    None => continue,
                };
                // block opened and closed on the same line
                if let Some(end) = inner.find("};") {
                    let body = inner[..end].trim();
                    if !body.is_empty() {
                        output.push_str(&self.expand_macros(body));
                        output.push('\n');
                    }
                    return Ok(());
                }
                if !inner.trim().is_empty() {
                    output.push_str(&self.expand_macros(inner.trim()));
                    output.push('\n');
                }
                in_header = true;
                continue;
            }
            if trimmed.starts_with("};") {
                return Ok(());
            }
            if trimmed.starts_with("#define") {
                self.process_define(trimmed["#define".len()..].trim())?;
            } else if trimmed.starts_with("#undef") {
                self.process_undef(trimmed["#undef".len()..].trim())?;
            } else if !trimmed.is_empty() {
                output.push_str(&self.expand_macros(line));
                output.push('\n');
            }
        }

        if in_header {
            return Err(PreprocessError::new(
                "unterminated header block in included file",
            ));
        }
        Ok(())
    }

    /// Capture an `asm { ... };` region: body lines go to `asm_blocks`, the
    /// whole region collapses to an `asm;` marker in the output.
    fn capture_asm<'a>(
        &mut self,
        first: &str,
        lines: &mut impl Iterator<Item = &'a str>,
        output: &mut String,
    ) -> Result<()> {
        let mut body = Vec::new();
        let mut closed = false;

        // anything after the opening brace on the same line is body text;
        // the block may also close on that same line
        let after_brace = first["asm".len()..].trim_start();
        let mut inline = after_brace[1..].trim();
        if let Some(end) = inline.find("};") {
            inline = inline[..end].trim_end();
            closed = true;
        }
        if !inline.is_empty() {
            body.push(inline.to_string());
        }

        if !closed {
            for line in lines.by_ref() {
                let trimmed = line.trim_start();
                if trimmed.starts_with("};") {
                    closed = true;
                    break;
                }
                body.push(line.trim().to_string());
            }
            if !closed {
                return Err(PreprocessError::new("unterminated asm block"));
            }
        }

        self.asm_blocks.push(AsmBlock { lines: body });
        output.push_str("asm;\n");
        Ok(())
    }

    /// Word-boundary macro substitution. Single pass, no rescan.
    fn expand_macros(&self, line: &str) -> String {
        let mut result = line.to_string();
        for (name, value) in &self.macros {
            result = replace_word(&result, name, value);
        }
        result
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}

fn is_asm_open(trimmed: &str) -> bool {
    trimmed.starts_with("asm") && trimmed["asm".len()..].trim_start().starts_with('{')
}

fn is_word_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

/// Replace whole-word occurrences of `word` in `text` with `replacement`.
fn replace_word(text: &str, word: &str, replacement: &str) -> String {
    let bytes = text.as_bytes();
    let mut result = String::with_capacity(text.len());
    let mut i = 0;

    while i < text.len() {
        if text[i..].starts_with(word) {
            let before_ok = i == 0 || !is_word_char(bytes[i - 1]);
            let after = i + word.len();
            let after_ok = after >= text.len() || !is_word_char(bytes[after]);
            if before_ok && after_ok {
                result.push_str(replacement);
                i = after;
                continue;
            }
        }
        // advance one full UTF-8 character
        let ch_len = text[i..].chars().next().map_or(1, char::len_utf8);
        result.push_str(&text[i..i + ch_len]);
        i += ch_len;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_simple_define() {
        let mut pp = Preprocessor::new();
        let source = "#define MAX 100\nint32 x = MAX;";
        let result = pp.process(source, "test.ent").unwrap();
        assert!(result.contains("int32 x = 100;"));
    }

    #[test]
    fn test_undef_removes_macro() {
        let mut pp = Preprocessor::new();
        let source = "#define N 7\n#undef N\nint32 x = N;";
        let result = pp.process(source, "test.ent").unwrap();
        assert!(result.contains("int32 x = N;"));
    }

    #[test]
    fn test_no_partial_replace() {
        let mut pp = Preprocessor::new();
        let source = "#define MAX 100\nint32 MAXIMUM = 50;";
        let result = pp.process(source, "test.ent").unwrap();
        assert!(result.contains("int32 MAXIMUM = 50;"));
    }

    #[test]
    fn test_last_definition_wins() {
        let mut pp = Preprocessor::new();
        let source = "#define N 1\n#define N 2\nreturn N;";
        let result = pp.process(source, "test.ent").unwrap();
        assert!(result.contains("return 2;"));
    }

    #[test]
    fn test_directive_becomes_blank_line() {
        let mut pp = Preprocessor::new();
        let source = "#define A 1\nreturn A;";
        let result = pp.process(source, "test.ent").unwrap();
        assert!(result.starts_with('\n'));
    }

    #[test]
    fn test_idempotent_without_directives() {
        let mut pp = Preprocessor::new();
        let source = "function main() -> int32 {\nreturn 0;\n};\n";
        let result = pp.process(source, "test.ent").unwrap();
        assert_eq!(result, source);
    }

    #[test]
    fn test_asm_capture() {
        let mut pp = Preprocessor::new();
        let source = "asm {\nmov rax, 60\nsyscall\n};\nreturn 0;";
        let result = pp.process(source, "test.ent").unwrap();
        assert!(result.contains("asm;"));
        assert!(!result.contains("syscall"));
        assert_eq!(pp.asm_blocks().len(), 1);
        assert_eq!(
            pp.asm_blocks()[0].lines,
            vec!["mov rax, 60".to_string(), "syscall".to_string()]
        );
    }

    #[test]
    fn test_single_line_asm_capture() {
        let mut pp = Preprocessor::new();
        let source = "asm { mov rax, 60 };\nreturn 0;";
        let result = pp.process(source, "test.ent").unwrap();
        assert!(result.contains("asm;"));
        // the following line is not swallowed into the block
        assert!(result.contains("return 0;"));
        assert_eq!(pp.asm_blocks().len(), 1);
        assert_eq!(pp.asm_blocks()[0].lines, vec!["mov rax, 60".to_string()]);
    }

    #[test]
    fn test_single_line_asm_as_last_line() {
        let mut pp = Preprocessor::new();
        let result = pp.process("asm { syscall };", "test.ent").unwrap();
        assert_eq!(result, "asm;\n");
        assert_eq!(pp.asm_blocks()[0].lines, vec!["syscall".to_string()]);
    }

    #[test]
    fn test_unterminated_asm_is_fatal() {
        let mut pp = Preprocessor::new();
        let source = "asm {\nmov rax, 60\n";
        assert!(pp.process(source, "test.ent").is_err());
    }

    #[test]
    fn test_header_gating_of_include() {
        let lib = temp_file(
            "entc_pp_lib.ent",
            "function hidden() -> int32 { return 42; };\nheader { function visible() -> int32; };\n",
        );
        let dir = lib.parent().unwrap().to_str().unwrap();
        let source = "#include \"entc_pp_lib.ent\"\nfunction main() -> int32 { return 0; };";
        let main_path = format!("{}/entc_pp_main.ent", dir);

        let mut pp = Preprocessor::new();
        let result = pp.process(source, &main_path).unwrap();
        assert!(result.contains("function visible() -> int32;"));
        assert!(!result.contains("hidden"));

        let _ = fs::remove_file(lib);
    }

    #[test]
    fn test_missing_include_is_fatal() {
        let mut pp = Preprocessor::new();
        let source = "#include \"entc_no_such_file.ent\"\n";
        assert!(pp.process(source, "test.ent").is_err());
    }

    #[test]
    fn test_angled_include_uses_search_path() {
        let lib = temp_file("entc_pp_sys.ent", "header { uint64 heap_base; };\n");
        let mut pp = Preprocessor::new();
        pp.add_include_path(lib.parent().unwrap());
        let result = pp
            .process("#include <entc_pp_sys.ent>\n", "/nowhere/main.ent")
            .unwrap();
        assert!(result.contains("uint64 heap_base;"));
        let _ = fs::remove_file(lib);
    }

    #[test]
    fn test_define_inside_included_header_applies() {
        let lib = temp_file(
            "entc_pp_defs.ent",
            "header {\n#define WORD 8\nuint64 page;\n};\n",
        );
        let dir = lib.parent().unwrap().to_str().unwrap();
        let mut pp = Preprocessor::new();
        let result = pp
            .process(
                "#include \"entc_pp_defs.ent\"\nreturn WORD;",
                &format!("{}/main.ent", dir),
            )
            .unwrap();
        assert!(result.contains("return 8;"));
        let _ = fs::remove_file(lib);
    }
}
