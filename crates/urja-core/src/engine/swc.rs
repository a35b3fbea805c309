//! swc-backed engine, built with the `swc` feature.
//!
//! Each module is parsed, stripped of TypeScript, compiled from JSX with the
//! automatic runtime and re-emitted. Like [`NativeEngine`](super::NativeEngine)
//! it does not link modules: a bundle compiles every entry on its own.

use super::native::{apply_defines, emit, file_name, load_entries, plan_targets};
use super::sourcemap::{external_comment, inline_comment};
use super::{
    BundleOutput, BundleRequest, Engine, EngineError, EsTarget, Loader, Metafile, SourceMapKind,
    TransformOptions, TransformOutput, JSX_IMPORT_SOURCE,
};
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

/// Engine backed by the swc compiler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwcEngine;

impl SwcEngine {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

struct Job<'a> {
    filename: &'a str,
    loader: Loader,
    target: EsTarget,
    minify: bool,
    refresh: bool,
}

struct Compiled {
    code: String,
    map: String,
}

#[async_trait]
impl Engine for SwcEngine {
    fn name(&self) -> &'static str {
        "swc"
    }

    async fn transform(
        &self,
        source: &str,
        options: &TransformOptions,
    ) -> Result<TransformOutput, EngineError> {
        if options.loader == Loader::Css {
            return Ok(TransformOutput {
                code: source.to_string(),
                map: None,
            });
        }

        let job = Job {
            filename: &options.filename,
            loader: options.loader,
            target: options.target,
            minify: false,
            refresh: options.refresh,
        };
        let compiled = compile(source, &job).map_err(|message| EngineError::Transform {
            file: options.filename.clone(),
            message,
        })?;

        let code = compiled.code.trim_end_matches('\n');
        match options.sourcemap {
            SourceMapKind::None => Ok(TransformOutput {
                code: compiled.code,
                map: None,
            }),
            SourceMapKind::Inline => Ok(TransformOutput {
                code: format!("{code}\n{}", inline_comment(&compiled.map)),
                map: None,
            }),
            SourceMapKind::External => {
                let map_file = format!("{}.map", file_name(&options.filename));
                Ok(TransformOutput {
                    code: format!("{code}\n{}", external_comment(&map_file)),
                    map: Some(compiled.map),
                })
            }
        }
    }

    async fn bundle(&self, request: &BundleRequest) -> Result<BundleOutput, EngineError> {
        let entries = load_entries(&request.input).await?;
        let mut output = BundleOutput::default();
        let mut metafile = Metafile::default();

        for (out, entry) in plan_targets(request, entries)? {
            let loader = Loader::from_path(Path::new(&entry.sourcefile)).unwrap_or_default();
            if loader == Loader::Css {
                emit(self.name(), &out, entry.contents, None, &mut output, &mut metafile).await?;
                continue;
            }

            let source = apply_defines(&entry.contents, &request.define);
            let job = Job {
                filename: &entry.sourcefile,
                loader,
                target: EsTarget::Es2020,
                minify: request.minify,
                refresh: false,
            };
            let compiled = compile(&source, &job).map_err(|message| EngineError::Bundle {
                message: format!("{}: {message}", entry.sourcefile),
            })?;
            debug!(entry = %entry.name, bytes = compiled.code.len(), "compiled entry");
            let map = request.sourcemap.then_some(compiled.map);
            emit(self.name(), &out, compiled.code, map, &mut output, &mut metafile).await?;
        }

        if request.metafile {
            output.metafile = Some(metafile);
        }
        Ok(output)
    }
}

fn compile(source: &str, job: &Job<'_>) -> Result<Compiled, String> {
    use swc_common::{
        comments::SingleThreadedComments, errors::Handler, sync::Lrc, FileName, Globals, Mark,
        SourceMap, GLOBALS,
    };
    use swc_ecma_ast::{EsVersion, Program};
    use swc_ecma_codegen::{text_writer::JsWriter, Emitter};
    use swc_ecma_parser::{lexer::Lexer, EsSyntax, Parser, StringInput, Syntax, TsSyntax};
    use swc_ecma_transforms_base::{fixer::fixer, hygiene::hygiene, resolver};
    use swc_ecma_transforms_react::{react, Options as ReactOptions, RefreshOptions, Runtime};
    use swc_ecma_transforms_typescript::strip;
    use swc_ecma_visit::FoldWith;

    let is_ts = job.loader.is_typescript();
    let is_jsx = job.loader.is_jsx();

    let cm: Lrc<SourceMap> = Lrc::default();
    let handler = Handler::with_emitter_writer(Box::new(std::io::sink()), Some(cm.clone()));
    let fm = cm.new_source_file(
        Lrc::new(FileName::Custom(job.filename.to_string())),
        source.to_string(),
    );

    let syntax = if is_ts {
        Syntax::Typescript(TsSyntax {
            tsx: is_jsx,
            decorators: true,
            ..Default::default()
        })
    } else {
        Syntax::Es(EsSyntax {
            jsx: is_jsx,
            decorators: true,
            ..Default::default()
        })
    };
    let target = match job.target {
        EsTarget::Es2015 => EsVersion::Es2015,
        EsTarget::Es2020 => EsVersion::Es2020,
        EsTarget::EsNext => EsVersion::EsNext,
    };

    let comments = SingleThreadedComments::default();
    let lexer = Lexer::new(syntax, target, StringInput::from(&*fm), Some(&comments));
    let mut parser = Parser::new_from(lexer);
    let module = parser.parse_module().map_err(|e| {
        let kind = format!("{:?}", e.kind());
        e.into_diagnostic(&handler).emit();
        format!("Failed to parse: {kind}")
    })?;
    let errors: Vec<String> = parser
        .take_errors()
        .into_iter()
        .map(|e| format!("{:?}", e.kind()))
        .collect();
    if !errors.is_empty() {
        return Err(errors.join(", "));
    }

    let module = GLOBALS.set(&Globals::default(), || {
        let unresolved_mark = Mark::new();
        let top_level_mark = Mark::new();

        let mut program = Program::Module(module);
        program = program.fold_with(&mut resolver(unresolved_mark, top_level_mark, is_ts));
        if is_ts {
            program = program.fold_with(&mut strip(unresolved_mark, top_level_mark));
        }
        let mut module = match program {
            Program::Module(m) => m,
            Program::Script(s) => swc_ecma_ast::Module {
                span: s.span,
                body: s
                    .body
                    .into_iter()
                    .map(swc_ecma_ast::ModuleItem::Stmt)
                    .collect(),
                shebang: s.shebang,
            },
        };

        if is_jsx {
            let options = ReactOptions {
                runtime: Some(Runtime::Automatic),
                import_source: Some(JSX_IMPORT_SOURCE.to_string()),
                refresh: job.refresh.then(RefreshOptions::default),
                ..Default::default()
            };
            module = module.fold_with(&mut react(
                cm.clone(),
                Some(&comments),
                options,
                top_level_mark,
                unresolved_mark,
            ));
        }

        module = module.fold_with(&mut hygiene());
        module.fold_with(&mut fixer(Some(&comments)))
    });

    let mut buf = Vec::new();
    let mut mappings = Vec::new();
    {
        let writer = JsWriter::new(cm.clone(), "\n", &mut buf, Some(&mut mappings));
        let mut emitter = Emitter {
            cfg: swc_ecma_codegen::Config::default()
                .with_minify(job.minify)
                .with_target(target),
            cm: cm.clone(),
            comments: Some(&comments),
            wr: writer,
        };
        emitter
            .emit_module(&module)
            .map_err(|e| format!("Failed to emit: {e}"))?;
    }
    let code = String::from_utf8(buf).map_err(|e| format!("Invalid UTF-8 output: {e}"))?;

    let mut map = Vec::new();
    cm.build_source_map(&mappings)
        .to_writer(&mut map)
        .map_err(|e| format!("Failed to write source map: {e}"))?;
    let map = String::from_utf8(map).map_err(|e| format!("Invalid UTF-8 source map: {e}"))?;

    Ok(Compiled { code, map })
}
