//! CSS optimization using lightningcss.

use lightningcss::printer::PrinterOptions;
use lightningcss::stylesheet::{MinifyOptions, ParserOptions, StyleSheet};
use lightningcss::targets::{Browsers, Targets};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CssError {
    #[error("CSS parse error in {file}: {message}")]
    Parse { file: String, message: String },

    #[error("CSS minify error in {file}: {message}")]
    Minify { file: String, message: String },

    #[error("CSS print error in {file}: {message}")]
    Print { file: String, message: String },
}

/// Browsers the optimizer lowers syntax for: Chrome 80+, Firefox 75+, Safari 13+, Edge 80+.
fn default_targets() -> Targets {
    Targets::from(Browsers {
        chrome: Some(80 << 16),
        firefox: Some(75 << 16),
        safari: Some(13 << 16),
        edge: Some(80 << 16),
        ..Default::default()
    })
}

/// Parse and re-print a stylesheet, minifying when asked.
pub fn optimize_css(source: &str, filename: &str, minify: bool) -> Result<String, CssError> {
    let parser_options = ParserOptions {
        filename: filename.to_string(),
        ..ParserOptions::default()
    };
    let mut stylesheet =
        StyleSheet::parse(source, parser_options).map_err(|e| CssError::Parse {
            file: filename.to_string(),
            message: e.to_string(),
        })?;

    if minify {
        stylesheet
            .minify(MinifyOptions {
                targets: default_targets(),
                ..MinifyOptions::default()
            })
            .map_err(|e| CssError::Minify {
                file: filename.to_string(),
                message: e.to_string(),
            })?;
    }

    let output = stylesheet
        .to_css(PrinterOptions {
            minify,
            targets: default_targets(),
            ..PrinterOptions::default()
        })
        .map_err(|e| CssError::Print {
            file: filename.to_string(),
            message: e.to_string(),
        })?;
    Ok(output.code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minify() {
        let out = optimize_css(".a {\n  color: red;\n}\n\n.b { margin: 0px; }\n", "a.css", true)
            .unwrap();
        assert!(!out.contains('\n'), "{out}");
        assert!(out.contains(".a{color:red}"), "{out}");
    }

    #[test]
    fn test_pretty_print_keeps_rules() {
        let out = optimize_css(".a{color:red}", "a.css", false).unwrap();
        assert!(out.contains(".a {"));
        assert!(out.contains("color: red"));
    }

    #[test]
    fn test_error_display_names_file() {
        let err = CssError::Parse {
            file: "broken.css".to_string(),
            message: "Unexpected token".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "CSS parse error in broken.css: Unexpected token"
        );
    }
}
