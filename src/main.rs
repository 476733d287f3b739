fn main() {
    if let Err(err) = gitdoc::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
