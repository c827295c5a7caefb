//! Standalone self-hosted PMIx server. Registers one demo namespace,
//! prints the environment each rank needs, then serves until stdin
//! closes.

use clap::{App, Arg};
use std::io::BufRead;

use pmix::logging;
use pmix::server::{SelfHost, Server, ServerConfig};
use pmix::types::Info;
use pmix::Value;

fn main() {
    let matches = App::new("pmix-server")
        .about("Runs a self-hosted PMIx server for local testing.")
        .arg(
            Arg::with_name("nprocs")
                .short("n")
                .long("nprocs")
                .takes_value(true)
                .default_value("2")
                .help("Number of local ranks to register"),
        )
        .arg(
            Arg::with_name("nspace")
                .long("nspace")
                .takes_value(true)
                .default_value("demo")
                .help("Namespace to register"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Increase log verbosity"),
        )
        .get_matches();

    let nprocs: i32 = matches
        .value_of("nprocs")
        .unwrap()
        .parse()
        .expect("nprocs must be an integer");
    let nspace = matches.value_of("nspace").unwrap().to_string();
    let verbosity = matches.occurrences_of("verbose") as u32;

    let log = logging::term_root(logging::severity_from_verbosity(verbosity));

    let config = ServerConfig {
        debug_verbosity: Some(verbosity),
        ..ServerConfig::default()
    };
    let server = Server::start(Box::new(SelfHost), config, log.clone())
        .expect("Failed to start server");

    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    server
        .register_nspace(
            &nspace,
            nprocs as usize,
            vec![
                Info::new("pmix.univ.size", Value::Uint32(nprocs as u32)),
                Info::new("pmix.job.size", Value::Uint32(nprocs as u32)),
                Info::new("pmix.local.size", Value::Uint32(nprocs as u32)),
                Info::new("pmix.nmap", Value::String(hostname)),
                Info::new(
                    "pmix.pmap",
                    Value::String(
                        (0..nprocs)
                            .map(|r| r.to_string())
                            .collect::<Vec<_>>()
                            .join(","),
                    ),
                ),
            ],
        )
        .expect("Failed to register namespace");

    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    for rank in 0..nprocs {
        server
            .register_client(&nspace, rank, uid, gid)
            .expect("Failed to register client");
    }

    println!("# server ready at {}", server.uri());
    for rank in 0..nprocs {
        let env: Vec<String> = server
            .setup_fork(&nspace, rank)
            .into_iter()
            .map(|(key, val)| format!("{}={}", key, val))
            .collect();
        println!("# rank {}: {}", rank, env.join(" "));
    }
    println!("# press enter (or close stdin) to shut down");

    let stdin = std::io::stdin();
    let mut line = String::new();
    let _ = stdin.lock().read_line(&mut line);

    server.finalize();
}
