use std::env;
use std::fs::File;
use std::io::prelude::*;

use pmlib::SavedState;

fn main() {
    for argument in env::args().skip(1) {
        println!("State file: {}", argument);
        println!("----------------------------------------------------------");

        let mut file = File::open(&argument).expect("File does not exist");
        let mut buf: Vec<u8> = Vec::new();
        match file.read_to_end(&mut buf) {
            Ok(len) => {
                println!("File read: {:?} bytes", len);
                match SavedState::parse(&buf) {
                    Ok(state) => {
                        println!(
                            "chooser: {}, {} section(s)",
                            state.chooser.name(),
                            state.sections.len()
                        );
                        for s in &state.sections {
                            println!(
                                "  '{}' started at {} ({} threads x {} events)",
                                s.label, s.start_time, s.threads, s.events
                            );
                            for t in 0..s.threads {
                                println!("    thread {}: {:?}", t, s.thread_row(t));
                            }
                        }
                    }
                    Err(e) => println!("not a valid state file: {}", e),
                }
            }
            Err(e) => {
                panic!("Can't read {}: {}", argument, e);
            }
        }
    }
}
