mod cli;
mod demangle;
mod module;
mod parser;
mod resolver;
mod writer;

use std::fs::File;
use std::io::Read;

use clap::Parser as _;
use log::info;
use memmap2::Mmap;
use mtrack_common::{Event, RecordReader, FILE_VERSION};

use crate::parser::{ParseError, Parser, Summary};
use crate::writer::ArtifactWriter;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let opt = cli::Opt::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if let Some(log_file) = &opt.log_file {
        match File::create(log_file) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(err) => {
                eprintln!("can't open log file '{}': {err}", log_file.display());
                return 1;
            }
        }
    }
    builder.init();

    if let Some(pid) = opt.pid {
        info!("parsing trace of pid {pid}");
    }

    if opt.dump {
        return dump(&opt);
    }

    let gzip = !opt.no_bundle && opt.output.extension().is_some_and(|ext| ext == "gz");
    let writer = match ArtifactWriter::create(&opt.output, gzip) {
        Ok(writer) => writer,
        Err(err) => {
            eprintln!("can't open file for write '{}': {err}", opt.output.display());
            return 2;
        }
    };

    let mut parser = Parser::new(writer, opt.threshold);
    let fed = if opt.packet_mode {
        feed_packets(&mut parser)
    } else {
        feed_file(&mut parser, &opt)
    };
    if let Some(code) = fed {
        return code;
    }

    match parser.finish() {
        Ok((summary, _)) => {
            print_summary(&summary);
            println!("wrote '{}'.", opt.output.display());
            0
        }
        Err(err) => {
            eprintln!("{err}");
            2
        }
    }
}

/// Feed the parser record-by-record from stdin. One pipe packet is one
/// record; a zero-length read is end-of-stream.
fn feed_packets(parser: &mut Parser) -> Option<i32> {
    let mut stdin = std::io::stdin().lock();
    let mut packet = [0u8; 4096];
    loop {
        match stdin.read(&mut packet) {
            Ok(0) => return None,
            Ok(n) => {
                if let Some(code) = feed_chunk(parser, &packet[..n]) {
                    return Some(code);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                eprintln!("error reading stdin: {err}");
                return Some(1);
            }
        }
    }
}

fn feed_file(parser: &mut Parser, opt: &cli::Opt) -> Option<i32> {
    let input = opt.input.as_ref().expect("clap requires --input");
    let file = match File::open(input) {
        Ok(file) => file,
        Err(_) => {
            eprintln!("no such file {}", input.display());
            return Some(1);
        }
    };
    let data = match unsafe { Mmap::map(&file) } {
        Ok(data) => data,
        Err(err) => {
            eprintln!("can't map {}: {err}", input.display());
            return Some(1);
        }
    };
    feed_chunk(parser, &data)
}

fn feed_chunk(parser: &mut Parser, data: &[u8]) -> Option<i32> {
    match parser.feed(data) {
        Ok(()) => None,
        Err(err @ ParseError::Write(_)) => {
            eprintln!("{err}");
            Some(2)
        }
        Err(err) => {
            eprintln!("{err}");
            Some(1)
        }
    }
}

/// `--dump`: decode the stream and print one line per record.
fn dump(opt: &cli::Opt) -> i32 {
    let mut data = Vec::new();
    if opt.packet_mode {
        if std::io::stdin().lock().read_to_end(&mut data).is_err() {
            eprintln!("error reading stdin");
            return 1;
        }
    } else {
        let input = opt.input.as_ref().expect("clap requires --input");
        match std::fs::read(input) {
            Ok(bytes) => data = bytes,
            Err(_) => {
                eprintln!("no such file {}", input.display());
                return 1;
            }
        }
    }

    if data.len() < 4 {
        eprintln!("no version");
        return 1;
    }
    let version = u32::from_le_bytes(data[..4].try_into().unwrap());
    if version != FILE_VERSION {
        eprintln!("invalid file version (got {version} vs {FILE_VERSION})");
        return 1;
    }

    let mut reader = RecordReader::new(&data[4..]);
    while !reader.is_empty() {
        match Event::read(&mut reader) {
            Ok(event) => println!("{} {event:?}", event.record_type().name()),
            Err(err) => {
                eprintln!("{err}");
                return 1;
            }
        }
    }
    0
}

fn print_summary(summary: &Summary) {
    println!("{} events. {} records.", summary.events, summary.records);
    println!(
        "{} strings {} hits {} misses. {} stacks {} hits {} misses.",
        summary.strings,
        summary.string_hits,
        summary.string_misses,
        summary.stacks,
        summary.stack_hits,
        summary.stack_misses
    );
    info!(
        "{} thread names, {} regions still tracked",
        summary.thread_names, summary.tracked_regions
    );
}
