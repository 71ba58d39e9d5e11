use anyhow::Result;

fn main() -> Result<()> {
    modroster::cli::run()
}
