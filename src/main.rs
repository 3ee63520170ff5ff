// src/main.rs

use batchparse::run_app;

fn main() {
    match run_app() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
