//! Two writers race on one pirate; the loser retries its unit of work
//!
//! Each attempt is a fresh session that reloads the row, reapplies the
//! change and commits. Only `StaleVersionConflict` is retried.

use std::error::Error;

use clap::Args;
use keel_core::{Entity, EntityRef, FlushSummary, KeelError, Session};

use super::open_database;
use crate::config::{CliConfig, Overrides};
use crate::domain::{Harbor, Pirate};

#[derive(Debug, Args)]
pub struct ConflictArgs {
    /// Attempts allowed for the losing writer, overriding the config file
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Nickname the losing writer wants to set
    #[arg(long, default_value = "Sparrow")]
    pub nickname: String,
}

/// Run `unit` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` units have failed; returns the result and attempts used
pub fn retry_unit_of_work<T>(
    max_attempts: u32,
    mut unit: impl FnMut(u32) -> keel_core::Result<T>,
) -> (keel_core::Result<T>, u32) {
    let mut attempt = 1;
    loop {
        match unit(attempt) {
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                tracing::warn!(attempt, error = %err, "unit of work conflicted, retrying");
                attempt += 1;
            }
            result => return (result, attempt),
        }
    }
}

fn describe(err: &KeelError) -> String {
    match err {
        KeelError::StaleVersionConflict {
            identity,
            expected_version: Some(version),
        } => format!("stale version conflict on {} (expected version {})", identity, version),
        other => other.to_string(),
    }
}

pub fn execute(args: ConflictArgs, config: &CliConfig) -> Result<(), Box<dyn Error>> {
    let config = config.clone().apply(Overrides {
        max_attempts: args.max_attempts,
        ..Overrides::default()
    });
    let max_attempts = config.max_attempts.max(1);
    let mut gateway_a = open_database(&config)?;
    let mut gateway_b = keel_store::SqliteGateway::open(&config.database)?;
    let harbor = Harbor::open(&gateway_a, config.session.clone())?;

    let mut setup = harbor.session();
    let jack = EntityRef::new(Pirate {
        name: "Jack".to_string(),
        bounty: 10_000,
        ..Default::default()
    });
    let key = setup.persist(&jack)?.key;
    setup.commit(&mut gateway_a)?;
    println!("setup    stored Pirate#{} at version 0", key);

    // Both writers load the row at the same version.
    let mut writer_a = harbor.session();
    let in_a = writer_a
        .find::<Pirate>(&mut gateway_a, key.clone())?
        .ok_or("pirate vanished")?;
    let mut stale: Option<(Session, EntityRef<Pirate>)> = {
        let mut writer_b = harbor.session();
        let in_b = writer_b
            .find::<Pirate>(&mut gateway_b, key.clone())?
            .ok_or("pirate vanished")?;
        Some((writer_b, in_b))
    };

    in_a.update(|p| p.bounty += 5_000);
    writer_a.commit(&mut gateway_a)?;
    println!("writer A committed bounty change");

    let (result, attempts) = retry_unit_of_work(max_attempts, |attempt| {
        let (mut session, pirate) = match stale.take() {
            Some(loaded) => loaded,
            None => {
                let mut session = harbor.session();
                let pirate = session
                    .find::<Pirate>(&mut gateway_b, key.clone())?
                    .ok_or_else(|| KeelError::EntityNotFound {
                        identity: keel_core::Identity::new(Pirate::ENTITY_TYPE, key.clone()),
                    })?;
                (session, pirate)
            }
        };
        pirate.update(|p| p.nickname = Some(args.nickname.clone()));
        let outcome: keel_core::Result<FlushSummary> = session.commit(&mut gateway_b);
        match &outcome {
            Ok(_) => println!(
                "attempt {} committed at version {}",
                attempt,
                pirate.read(|p| p.version)
            ),
            Err(err) => println!("attempt {} failed: {}", attempt, describe(err)),
        }
        outcome
    });

    match result {
        Ok(_) => {
            println!("writer B succeeded after {} attempt(s)", attempts);
            Ok(())
        }
        Err(err) => Err(format!("writer B gave up after {} attempt(s): {}", attempts, err).into()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use keel_core::Identity;

    fn stale() -> KeelError {
        KeelError::StaleVersionConflict {
            identity: Identity::new("Pirate", 1),
            expected_version: Some(0),
        }
    }

    #[test]
    fn test_retry_stops_at_first_success() {
        let (result, attempts) =
            retry_unit_of_work(5, |attempt| if attempt < 3 { Err(stale()) } else { Ok(attempt) });

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_retry_is_bounded() {
        let mut calls = 0;
        let (result, attempts) = retry_unit_of_work::<()>(2, |_| {
            calls += 1;
            Err(stale())
        });

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(attempts, 2);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_non_retryable_error_is_not_retried() {
        let (result, attempts) = retry_unit_of_work::<()>(5, |_| {
            Err(KeelError::Internal {
                message: "boom".to_string(),
            })
        });

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
