use anyhow::Result;

fn main() -> Result<()> {
    playbox::cli::run()
}
