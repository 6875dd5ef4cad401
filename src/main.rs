//! entc - compiler for the Ent systems language
//!
//! A single-pass batch compiler: preprocess, lex, parse and emit x86-64
//! NASM assembly, then optionally hand the text to the external assembler
//! and linker. Each stage runs to completion before the next begins.

mod ast;
mod codegen;
mod diag;
mod lexer;
mod parser;
mod preprocess;
mod token;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{self, Command};

use clap::{Parser as ClapParser, ValueEnum};

use codegen::CodeGen;
use diag::CompileError;
use lexer::Lexer;
use parser::Parser;
use preprocess::Preprocessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Linked ELF executable
    Elf,
    /// Relocatable object file
    Obj,
    /// Flat binary
    Bin,
}

#[derive(Debug, ClapParser)]
#[command(
    name = "entc",
    version,
    about = "Compiler for the Ent systems language",
    disable_version_flag = true
)]
struct Cli {
    /// Input source files
    #[arg(value_name = "input-files")]
    inputs: Vec<PathBuf>,

    /// Print version information
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: (),

    /// Output path
    #[arg(short, long, default_value = "a.out")]
    output: PathBuf,

    /// Emit assembly only
    #[arg(short = 'S')]
    assembly_only: bool,

    /// Stop after preprocessing and print the result
    #[arg(short = 'E')]
    preprocess_only: bool,

    /// Print the parsed AST and exit
    #[arg(long = "ast")]
    show_ast: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Elf)]
    format: OutputFormat,

    /// Append a directory to the include search list
    #[arg(short = 'I', long = "include", value_name = "path")]
    include_paths: Vec<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(error) = run(&cli) {
        diag::print_fatal(&error);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), CompileError> {
    if cli.inputs.is_empty() {
        return Err(CompileError::Args("no input files".to_string()));
    }
    if cli.inputs.len() > 1 {
        return Err(CompileError::Args(
            "multiple input files are not supported".to_string(),
        ));
    }
    let input = &cli.inputs[0];
    let filename = input.display().to_string();

    let source = fs::read_to_string(input)
        .map_err(|e| CompileError::Args(format!("could not open file: {}: {}", filename, e)))?;

    let mut preprocessor = Preprocessor::new();
    preprocessor.add_include_path("/usr/include/ents");
    for path in &cli.include_paths {
        preprocessor.add_include_path(path.clone());
    }
    let processed = preprocessor.process(&source, &filename)?;

    if cli.preprocess_only {
        print!("{}", processed);
        return Ok(());
    }

    let mut lexer = Lexer::new(&processed);
    let tokens = lexer.tokenize()?;
    for error in lexer.errors() {
        diag::print_error(error);
    }

    let mut parser = Parser::new(tokens, preprocessor.take_asm_blocks());
    let program = parser.parse()?;

    if cli.show_ast {
        println!("{:#?}", program);
        return Ok(());
    }

    let (typedefs, struct_defs) = parser.into_tables();
    let mut codegen = CodeGen::new(typedefs, struct_defs);
    let assembly = codegen.generate(&program)?;

    if cli.assembly_only {
        fs::write(&cli.output, assembly)?;
        return Ok(());
    }
    assemble_and_link(&assembly, &cli.output, cli.format)
}

/// Hand the generated text to nasm (and ld for an executable). These are
/// external collaborators; a missing tool is a fatal diagnostic.
fn assemble_and_link(
    assembly: &str,
    output: &Path,
    format: OutputFormat,
) -> Result<(), CompileError> {
    let asm_path = output.with_extension("s");
    fs::write(&asm_path, assembly)?;

    let result = match format {
        OutputFormat::Bin => run_tool(
            Command::new("nasm")
                .args(["-f", "bin", "-o"])
                .arg(output)
                .arg(&asm_path),
        ),
        OutputFormat::Obj => run_tool(
            Command::new("nasm")
                .args(["-f", "elf64", "-o"])
                .arg(output)
                .arg(&asm_path),
        ),
        OutputFormat::Elf => {
            let obj_path = output.with_extension("o");
            let assembled = run_tool(
                Command::new("nasm")
                    .args(["-f", "elf64", "-o"])
                    .arg(&obj_path)
                    .arg(&asm_path),
            );
            let linked = assembled.and_then(|_| {
                run_tool(Command::new("ld").arg("-o").arg(output).arg(&obj_path))
            });
            let _ = fs::remove_file(&obj_path);
            linked
        }
    };

    let _ = fs::remove_file(&asm_path);
    result
}

fn run_tool(command: &mut Command) -> Result<(), CompileError> {
    let program = command.get_program().to_string_lossy().to_string();
    let output = command.output().map_err(|e| {
        CompileError::Toolchain(format!("failed to run {}: {}", program, e))
    })?;
    if !output.status.success() {
        return Err(CompileError::Toolchain(format!(
            "{} failed: {}",
            program,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
