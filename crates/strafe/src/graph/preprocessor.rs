//! Textual `#include` preprocessing of pass sources.
//!
//! Exactly one include level is supported: an included file must not itself
//! contain include directives. That keeps directive byte positions meaningful
//! and sidesteps cycle handling entirely; a nested include is a hard error
//! rather than silently undefined behavior.

use super::grammar::Grammar;
use super::GraphBuildError;
use log::*;

/// One collected `#include` directive.
#[derive(Debug, Clone, PartialEq)]
pub struct Include {
    /// Included file name, with extension.
    pub filename: String,
    /// Byte offset of the directive's `#`.
    pub pos: usize,
    /// Directive length in bytes, `#` through the extension.
    pub len: usize,
}

/// Collects all include directives of one source, in ascending position.
pub fn collect_includes(
    grammar: &Grammar,
    file: &str,
    src: &str,
) -> Result<Vec<Include>, GraphBuildError> {
    let root = grammar.run(src).map_err(|err| GraphBuildError::InvalidPassSource {
        file: file.to_string(),
        line: err.line,
        column: err.column,
        message: "preprocessing failed".to_string(),
    })?;

    let mut includes: Vec<Include> = root
        .all(grammar, "Instruction")
        .map(|node| {
            let filename = node
                .find(grammar, "IncludeFile")
                .expect("Instruction without IncludeFile")
                .token_text(src)
                .to_string();
            Include {
                filename,
                pos: node.start,
                len: node.end - node.start,
            }
        })
        .collect();

    includes.sort_by_key(|include| include.pos);
    Ok(includes)
}

/// Substitutes the collected directives, resolving each included file through
/// `load`. The result is a fixed point: re-running the preprocessor on it
/// yields no directives, because nested includes are rejected.
pub fn substitute(
    grammar: &Grammar,
    file: &str,
    src: &str,
    includes: &[Include],
    mut load: impl FnMut(&str) -> Result<String, GraphBuildError>,
) -> Result<String, GraphBuildError> {
    if includes.is_empty() {
        return Ok(src.to_string());
    }

    let mut processed = String::with_capacity(src.len());
    let mut current_pos = 0;

    for include in includes {
        trace!("{file}: including {}", include.filename);

        let included = load(&include.filename)?;
        if !collect_includes(grammar, &include.filename, &included)?.is_empty() {
            return Err(GraphBuildError::InvalidPassSource {
                file: include.filename.clone(),
                line: 1,
                column: 1,
                message: format!(
                    "nested #include while included from `{file}`; only one include level is supported"
                ),
            });
        }

        processed.push_str(&src[current_pos..include.pos]);
        processed.push_str(&included);
        current_pos = include.pos + include.len;
    }

    processed.push_str(&src[current_pos..]);
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::load_grammar_file;

    fn preprocessor_grammar() -> Grammar {
        load_grammar_file(crate::test_support::grammar_dir().join("preprocessor.peg")).unwrap()
    }

    #[test]
    fn collects_positions_and_names() {
        let grammar = preprocessor_grammar();
        let src = "aaa\n#include shared.passh\nbbb #include other.passh end";

        let includes = collect_includes(&grammar, "test.pass", src).unwrap();
        assert_eq!(includes.len(), 2);

        assert_eq!(includes[0].filename, "shared.passh");
        assert_eq!(&src[includes[0].pos..includes[0].pos + includes[0].len], "#include shared.passh");

        assert_eq!(includes[1].filename, "other.passh");
        assert_eq!(&src[includes[1].pos..includes[1].pos + includes[1].len], "#include other.passh");
    }

    #[test]
    fn substitution_is_a_fixed_point() {
        let grammar = preprocessor_grammar();
        let src = "before\n#include a.passh\nmiddle\n#include b.passh\nafter";

        let includes = collect_includes(&grammar, "test.pass", src).unwrap();
        let result = substitute(&grammar, "test.pass", src, &includes, |name| {
            Ok(match name {
                "a.passh" => "AAA".to_string(),
                "b.passh" => "BBB".to_string(),
                other => panic!("unexpected include {other}"),
            })
        })
        .unwrap();

        assert_eq!(result, "before\nAAA\nmiddle\nBBB\nafter");
        assert!(collect_includes(&grammar, "test.pass", &result).unwrap().is_empty());
    }

    #[test]
    fn nested_includes_are_rejected() {
        let grammar = preprocessor_grammar();
        let src = "#include outer.passh";

        let includes = collect_includes(&grammar, "test.pass", src).unwrap();
        let err = substitute(&grammar, "test.pass", src, &includes, |_| {
            Ok("#include inner.passh".to_string())
        })
        .unwrap_err();

        assert!(matches!(err, GraphBuildError::InvalidPassSource { .. }));
    }

    #[test]
    fn hash_in_shader_text_is_not_a_directive() {
        let grammar = preprocessor_grammar();
        let src = "color = #BADBEEF; // not an include";
        assert!(collect_includes(&grammar, "test.pass", src).unwrap().is_empty());
    }
}
