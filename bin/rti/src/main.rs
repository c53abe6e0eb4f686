use std::{env, fs, process};

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use rtinfer::prelude::*;

fn usage() {
    eprintln!("Usage: rti TEST_TYPE SIGNIFICANCE file");
    eprintln!("  TEST_TYPE is 1 for likelihood ratio, 2 for chi squared");
    eprintln!("  SIGNIFICANCE is a decision (float) value between 0.0 and 1.0, default is 0.05 (5% significance)");
    eprintln!("  file is an input file containing unlabeled timed strings");
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::filter::LevelFilter::INFO),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 4 {
        usage();
        process::exit(0);
    }
    let Some(test_type) = args[1]
        .parse::<u32>()
        .ok()
        .and_then(|code| TestType::try_from(code).ok())
    else {
        usage();
        process::exit(0);
    };
    let Ok(significance) = args[2].parse::<f64>() else {
        usage();
        process::exit(0);
    };

    let input = match fs::read_to_string(&args[3]) {
        Ok(input) => input,
        Err(error) => {
            eprintln!("cannot read {}: {error}", args[3]);
            process::exit(0);
        }
    };
    let sample = match TimedSample::parse(&input) {
        Ok(sample) => sample,
        Err(error) => {
            eprintln!("cannot parse {}: {error}", args[3]);
            process::exit(0);
        }
    };

    let params = Params::for_sample(&sample, test_type, significance);
    info!(
        words = sample.num_words(),
        alphabet = sample.alphabet().len(),
        max_time = params.max_time,
        "corpus loaded"
    );

    let automaton = Automaton::new(sample, params);
    let mut searcher = Searcher::new(automaton);
    searcher.best_first();
    info!(
        nodes = searcher.nodes(),
        best = ?searcher.best_solution(),
        "search finished"
    );

    process::exit(1);
}
