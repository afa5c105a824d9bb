fn main() {
    std::process::exit(botbox::cli::run());
}
