use std::io::Write;
use std::process::exit;

use lunac_compiler::codegen::compile;
use lunac_compiler::disasm::disassemble;
use lunac_compiler::dump::dump;

const PROGRAM: &str = "lunac";
const DEFAULT_OUTPUT: &str = "luac.out";

fn usage(message: Option<&str>) -> ! {
    if let Some(message) = message {
        eprintln!("{PROGRAM}: {message}");
    }
    eprintln!(
        "usage: {PROGRAM} [options] filename\n\
         Available options are:\n\
         \x20 -l       list bytecode\n\
         \x20 -o name  output to file 'name' (default is \"{DEFAULT_OUTPUT}\")\n\
         \x20 -p       parse only\n\
         \x20 -s       strip debug information\n\
         \x20 -v       show version information\n\
         \x20 --       stop handling options"
    );
    exit(1);
}

fn fatal(message: &str) -> ! {
    eprintln!("{PROGRAM}: {message}");
    exit(1);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut list = false;
    let mut parse_only = false;
    let mut strip = false;
    let mut show_version = false;
    let mut output: Option<String> = None;
    let mut input: Option<String> = None;
    let mut saw_dashdash = false;

    let mut i = 1;
    while i < args.len() {
        let arg = &args[i];
        if saw_dashdash || !arg.starts_with('-') || arg == "-" {
            if input.is_some() {
                usage(Some("too many input files"));
            }
            input = Some(arg.clone());
            i += 1;
            continue;
        }
        match arg.as_str() {
            "--" => {
                saw_dashdash = true;
                i += 1;
            }
            "-l" => {
                list = true;
                i += 1;
            }
            "-p" => {
                parse_only = true;
                i += 1;
            }
            "-s" => {
                strip = true;
                i += 1;
            }
            "-v" => {
                show_version = true;
                i += 1;
            }
            "-o" => {
                if i + 1 >= args.len() {
                    usage(Some("'-o' needs argument"));
                }
                output = Some(args[i + 1].clone());
                i += 2;
            }
            _ => usage(Some(&format!("unrecognized option '{arg}'"))),
        }
    }

    if show_version {
        println!("{PROGRAM} {} -- Lua 5.1 bytecode compiler", env!("CARGO_PKG_VERSION"));
        if input.is_none() {
            return;
        }
    }

    let Some(input) = input else {
        usage(Some("no input file given"));
    };

    let source = match std::fs::read(&input) {
        Ok(bytes) => bytes,
        Err(e) => fatal(&format!("cannot open {input}: {e}")),
    };
    let chunk_name = format!("@{input}");

    let (proto, strings) = match compile(&source, &chunk_name) {
        Ok(result) => result,
        Err(e) => fatal(&format!("{input}:{e}")),
    };

    if list {
        print!("{}", disassemble(&proto, &strings));
    }
    if parse_only {
        return;
    }

    let bytes = dump(&proto, &strings, strip);
    let out_path = output.as_deref().unwrap_or(DEFAULT_OUTPUT);
    let result = std::fs::File::create(out_path)
        .and_then(|mut f| f.write_all(&bytes));
    if let Err(e) = result {
        fatal(&format!("cannot write {out_path}: {e}"));
    }
}
