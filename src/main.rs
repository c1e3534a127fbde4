fn main() {
    let tenant_id = std::env::args().nth(1).unwrap_or_else(|| "default".to_string());
    if let Err(e) = telecare_lib::run(&tenant_id) {
        eprintln!("telecare: {e}");
        std::process::exit(1);
    }
}
