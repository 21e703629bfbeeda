use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    squeeze_cli::cli()
}
