fn main() {
    if let Err(err) = greenhouse_ingest::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
