fn main() {
    std::process::exit(gradebox::cli::run());
}
