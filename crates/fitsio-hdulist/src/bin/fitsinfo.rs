use std::process;

use fitsio_hdulist::{Config, HduList, OpenMode};

fn run(args: &[String]) -> Result<String, String> {
    let mut verbose = false;
    let mut verify = false;
    let mut file_path = None;

    for arg in args {
        match arg.as_str() {
            "-v" | "--verbose" => verbose = true,
            "-c" | "--checksum" => verify = true,
            other if other.starts_with('-') => return Err(format!("Unknown option: {}", other)),
            other => {
                if file_path.is_some() {
                    return Err("Too many arguments".to_string());
                }
                file_path = Some(other);
            }
        }
    }

    let path = file_path.ok_or_else(|| {
        "Usage: fitsinfo [-v] [-c] <file.fits>\n\nPrint HDU summary for a FITS file.".to_string()
    })?;

    let mut list = HduList::open(path, OpenMode::ReadOnly, &Config::from_env())
        .map_err(|e| format!("Error reading '{}': {}", path, e))?;

    let mut out = list.to_string();
    if verbose {
        for (i, hdu) in list.iter().enumerate() {
            out.push_str(&format!("\nHDU {} header:\n", i));
            for card in hdu.header().iter() {
                out.push_str(card.image().trim_end());
                out.push('\n');
            }
            for warning in hdu.warnings() {
                out.push_str(&format!("  warning: {}\n", warning));
            }
        }
    }
    if verify {
        let problems = list
            .verify_checksums()
            .map_err(|e| format!("Error verifying '{}': {}", path, e))?;
        if problems.is_empty() {
            out.push_str("\nChecksums OK\n");
        }
        for problem in problems {
            out.push_str(&format!("\n{}", problem));
        }
    }
    Ok(out)
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(output) => print!("{}", output),
        Err(msg) => {
            eprintln!("{}", msg);
            process::exit(1);
        }
    }
}
