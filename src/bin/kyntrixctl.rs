use anyhow::Result;

fn main() -> Result<()> {
    kyntrixd::cli::run(kyntrixd::cli::CliMode::Control)
}
