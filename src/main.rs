fn main() {
    if let Err(err) = attendify_lib::run() {
        log::error!("{err:#}");
        eprintln!("attendify: {err:#}");
        std::process::exit(1);
    }
}
