//! Test client. Reads its identity from the PMIX_* environment, puts a
//! key, commits, optionally fences, then reads every rank's contribution
//! back.

use std::time::Duration;

use clap::{App, Arg};

use pmix::client::Client;
use pmix::logging;
use pmix::types::{Range, RANK_WILDCARD};
use pmix::{Scope, Value};

fn main() {
    let matches = App::new("pmix-client")
        .about("Exercises put/commit/fence/get against the local server.")
        .arg(
            Arg::with_name("nprocs")
                .short("n")
                .takes_value(true)
                .help("Expected number of ranks (defaults to pmix.univ.size)"),
        )
        .arg(
            Arg::with_name("timeout")
                .long("timeout")
                .takes_value(true)
                .default_value("10")
                .help("Seconds to wait on blocking calls before giving up"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Increase log verbosity"),
        )
        .arg(
            Arg::with_name("barrier")
                .long("barrier")
                .help("Fence without data collection"),
        )
        .arg(
            Arg::with_name("collect")
                .long("collect")
                .help("Fence with data collection"),
        )
        .arg(
            Arg::with_name("non-blocking")
                .long("non-blocking")
                .help("Issue the fence non-blocking and wait explicitly"),
        )
        .get_matches();

    let verbosity = matches.occurrences_of("verbose") as u32
        + std::env::var("PMIX_DEBUG")
            .ok()
            .and_then(|raw| raw.parse::<u32>().ok())
            .unwrap_or(0);
    let log = logging::term_root(logging::severity_from_verbosity(verbosity));

    let client = Client::init(log).expect("Failed to initialize PMIx client");
    let nspace = client.nspace().to_string();
    let rank = client.rank();
    let _timeout = Duration::from_secs(
        matches
            .value_of("timeout")
            .unwrap()
            .parse()
            .expect("timeout must be an integer"),
    );

    let nprocs: i32 = match matches.value_of("nprocs") {
        Some(raw) => raw.parse().expect("nprocs must be an integer"),
        None => match client.get(&nspace, RANK_WILDCARD, "pmix.univ.size") {
            Ok(Value::Uint32(count)) => count as i32,
            _ => 1,
        },
    };

    println!("[{}:{}] initialized ({} ranks)", nspace, rank, nprocs);

    client
        .put(Scope::Global, "test-key", Value::Int(rank))
        .expect("put failed");
    client.commit().expect("commit failed");

    let collect = matches.is_present("collect") || !matches.is_present("barrier");
    let participants = [Range::all(nspace.clone())];
    if matches.is_present("non-blocking") {
        let pending = client
            .fence_nb(&participants, collect)
            .expect("fence_nb failed");
        println!("[{}:{}] fence posted", nspace, rank);
        pending.wait().expect("fence wait failed");
    } else {
        client.fence(&participants, collect).expect("fence failed");
    }
    println!("[{}:{}] fence complete", nspace, rank);

    for other in 0..nprocs {
        match client.get(&nspace, other, "test-key") {
            Ok(value) => println!("[{}:{}] rank {} -> {:?}", nspace, rank, other, value),
            Err(status) => {
                eprintln!("[{}:{}] rank {} -> error {}", nspace, rank, other, status);
                std::process::exit(1);
            }
        }
    }

    client.finalize().expect("finalize failed");
    println!("[{}:{}] finalized", nspace, rank);
}
