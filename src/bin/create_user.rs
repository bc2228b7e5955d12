use anyhow::{bail, Result};
use std::env;
use zettel_server::auth::hash_password;
use zettel_server::config::Config;
use zettel_server::database::Database;

const USAGE: &str = "Usage: create_user <username> <password> [--update]";

#[derive(Debug, PartialEq)]
struct Args {
    username: String,
    password: String,
    update: bool,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let update = args.iter().any(|a| a == "--update");
    let positional: Vec<&String> = args.iter().filter(|a| !a.starts_with("--")).collect();

    match positional.as_slice() {
        [username, password] if !username.is_empty() && !password.is_empty() => Ok(Args {
            username: username.to_string(),
            password: password.to_string(),
            update,
        }),
        _ => bail!(USAGE),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args: Vec<String> = env::args().skip(1).collect();
    let args = parse_args(&args)?;

    let config = Config::from_env()?;
    println!("=== User Provisioning ===");
    println!("Connecting to database...");
    let db = Database::connect(&config.database.url, config.database.max_connections).await?;

    let hash = hash_password(&args.password)?;

    match db.get_user_by_username(&args.username).await? {
        Some(existing) if args.update => {
            db.update_user_password(existing.id, &hash).await?;
            println!("✓ Updated password for '{}' (id {})", existing.username, existing.id);
        }
        Some(existing) => {
            bail!(
                "User '{}' already exists (id {}); pass --update to reset the password",
                existing.username,
                existing.id
            );
        }
        None => {
            let user = db.create_user(&args.username, &hash).await?;
            println!("✓ Created user '{}' (id {})", user.username, user.id);
        }
    }

    Ok(())
}
