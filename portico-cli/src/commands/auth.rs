//! `portico auth` — persist the authentication token.

use crate::config;
use anyhow::Result;
use clap::Args;

#[derive(Args, Debug)]
pub struct AuthArgs {
    /// Token issued by the server dashboard
    pub token: String,
}

pub fn run(args: AuthArgs) -> Result<()> {
    let mut cfg = config::load()?;
    cfg.token = args.token;
    let path = config::save(&cfg)?;
    println!("Token saved to {}", path.display());
    Ok(())
}
