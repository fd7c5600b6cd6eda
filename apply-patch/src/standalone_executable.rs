use std::ffi::OsString;
use std::io::Read;
use std::io::Write;

const USAGE: &str = "Usage: apply_patch 'PATCH'\n       echo 'PATCH' | apply_patch";

pub fn main() -> ! {
    std::process::exit(run_main());
}

/// Entry point shared by the `apply_patch` binary and the argv[0] alias.
/// The patch comes from the single argument, or from stdin when there is
/// none. Returns the process exit code.
pub fn run_main() -> i32 {
    let patch = match read_patch(std::env::args_os().skip(1).collect()) {
        Ok(patch) => patch,
        Err((code, message)) => {
            eprintln!("{message}");
            return code;
        }
    };

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    if crate::apply_patch(&patch, &mut stdout, &mut stderr).is_err() {
        return 1;
    }
    let _ = stdout.flush();
    0
}

fn read_patch(args: Vec<OsString>) -> Result<String, (i32, String)> {
    match <[OsString; 1]>::try_from(args) {
        Ok([arg]) => arg.into_string().map_err(|_| {
            (
                1,
                "Error: apply_patch requires a UTF-8 PATCH argument.".to_string(),
            )
        }),
        Err(args) if args.is_empty() => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|err| (1, format!("Error: failed to read PATCH from stdin: {err}")))?;
            if buf.trim().is_empty() {
                return Err((2, USAGE.to_string()));
            }
            Ok(buf)
        }
        Err(_) => Err((
            2,
            "Error: apply_patch accepts exactly one argument.".to_string(),
        )),
    }
}
