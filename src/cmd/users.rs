//! Database setup and user management — `fieldops init-db`, `fieldops users`.

use anyhow::{Result, anyhow};
use fieldops::config::FieldOpsToml;
use fieldops::office::models::UserRole;

use super::super::UsersCommands;
use super::open_db;

pub fn cmd_init_db(settings: &FieldOpsToml, admin: Option<&str>) -> Result<()> {
    let db = open_db(settings)?;
    println!(
        "Database initialized at {}",
        settings.database.path.display()
    );

    if let Some(username) = admin {
        match db.get_user_by_username(username)? {
            Some(_) => println!("Admin user '{}' already exists", username),
            None => {
                db.create_user(username, "", UserRole::Admin)?;
                println!("Created admin user '{}'", username);
            }
        }
    }
    Ok(())
}

pub fn cmd_users(settings: &FieldOpsToml, command: Option<UsersCommands>) -> Result<()> {
    let db = open_db(settings)?;

    match command {
        None | Some(UsersCommands::List) => {
            let users = db.list_users(false)?;
            if users.is_empty() {
                println!("No users. Create one with `fieldops users add <username>`.");
                return Ok(());
            }
            for user in users {
                println!(
                    "{:<4} {:<20} {:<22} {}",
                    user.id,
                    user.username,
                    user.role.as_str(),
                    if user.is_active { "active" } else { "inactive" }
                );
            }
        }
        Some(UsersCommands::Add {
            username,
            role,
            full_name,
        }) => {
            let role: UserRole = role.parse().map_err(|e: String| anyhow!(e))?;
            let user = db.create_user(&username, &full_name, role)?;
            println!("Created {} '{}' (id {})", role.as_str(), user.username, user.id);
        }
        Some(UsersCommands::Deactivate { username }) => {
            let user = db
                .get_user_by_username(&username)?
                .ok_or_else(|| anyhow!("Unknown user '{}'", username))?;
            db.set_user_active(user.id, false)?;
            println!("Deactivated '{}'", username);
        }
    }
    Ok(())
}
