fn main() {
    if let Err(err) = csv_datespan::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
