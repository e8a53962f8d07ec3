//! Generates a Sphynx static key-pair file and a pre-shared session-key file, the out-of-band
//! material `sphynx-server` and the embedding client load at startup.
//!
//! A small `clap`-driven CLI: parse args, generate the artifact, write it out, print a short
//! summary.

use clap::{App, Arg};
use sphynx_core::crypto::keys::StaticKeyPair;
use sphynx_core::crypto::random_bytes;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::process;

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Restrict a just-written secret file to owner read/write only, since `fs::write` leaves it at
/// the process umask (typically world-readable).
fn restrict_to_owner(path: &str) {
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        eprintln!("Failed to restrict permissions on `{}`: {}", path, err);
        process::exit(1);
    }
}

fn main() {
    let matches = App::new("Sphynx Key Generator")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Generates a static key-pair file and a pre-shared session-key file.")
        .arg(
            Arg::with_name("KEY_FILE")
                .help("Path the static key-pair file will be written to")
                .required(true),
        )
        .arg(
            Arg::with_name("SESSION_KEY_FILE")
                .help("Path the pre-shared session-key file will be written to")
                .required(true),
        )
        .arg(
            Arg::with_name("force")
                .short("f")
                .long("force")
                .help("Overwrite existing files instead of refusing to run"),
        )
        .get_matches();

    let key_file_path = matches.value_of("KEY_FILE").unwrap();
    let session_key_file_path = matches.value_of("SESSION_KEY_FILE").unwrap();
    let force = matches.is_present("force");

    if !force {
        for path in [key_file_path, session_key_file_path] {
            if fs::metadata(path).is_ok() {
                eprintln!("Refusing to overwrite existing file `{}` (pass --force)", path);
                process::exit(1);
            }
        }
    }

    let key_pair = StaticKeyPair::generate();
    fs::write(key_file_path, key_pair.to_bytes()).unwrap_or_else(|err| {
        eprintln!("Failed writing key file `{}`: {}", key_file_path, err);
        process::exit(1);
    });
    restrict_to_owner(key_file_path);

    let mut session_key = [0u8; 32];
    random_bytes(&mut session_key);
    fs::write(session_key_file_path, session_key).unwrap_or_else(|err| {
        eprintln!("Failed writing session key file `{}`: {}", session_key_file_path, err);
        process::exit(1);
    });
    restrict_to_owner(session_key_file_path);

    println!("Wrote static key pair to `{}`", key_file_path);
    println!("Wrote pre-shared session key to `{}`", session_key_file_path);
    println!();
    println!("Public key (distribute to clients, keep the rest of the key file secret):");
    println!("  {}", hex(&key_pair.public_key()));
    println!("Pre-shared session key (distribute out-of-band, alongside the public key):");
    println!("  {}", hex(&session_key));
}
