#![forbid(unsafe_code)]

use std::env;
use std::io::{self, IsTerminal, Read};

use medproof_tools::key_cli::{execute_key_command, secret_prompt_for, USAGE};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let subcommand = args.first().ok_or_else(|| USAGE.to_string())?.as_str();
    let secret = match secret_prompt_for(subcommand) {
        Some(prompt) => Some(read_secret_value(prompt)?),
        None => None,
    };
    let output = execute_key_command(subcommand, &args[1..], secret.as_deref())?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

fn read_secret_value(prompt: &str) -> Result<String, String> {
    let value = if io::stdin().is_terminal() {
        rpassword::prompt_password(format!("Enter {prompt}:")).map_err(|e| e.to_string())?
    } else {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .map_err(|e| e.to_string())?;
        input
    };
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        return Err("secret value must not be empty".to_string());
    }
    Ok(trimmed)
}
