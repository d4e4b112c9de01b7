// src/auth.rs
use crate::db::Ledger;
use crate::error::{AppError, Result};
use crate::models::{LoginForm, RegisterForm, UserId};
use crate::session::{Context, SessionStore};
use log::{info, warn};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::task;

/// A freshly established login.
#[derive(Debug)]
pub struct Session {
    pub token: String,
    pub context: Context,
}

/// Registration, login and logout on top of the ledger's user table.
pub struct Accounts {
    ledger: Arc<Ledger>,
    sessions: Arc<SessionStore>,
    starting_cash: Decimal,
    bcrypt_cost: u32,
}

impl Accounts {
    pub fn new(
        ledger: Arc<Ledger>,
        sessions: Arc<SessionStore>,
        starting_cash: Decimal,
        bcrypt_cost: u32,
    ) -> Self {
        Accounts {
            ledger,
            sessions,
            starting_cash,
            bcrypt_cost,
        }
    }

    pub fn session_ttl_secs(&self) -> i64 {
        self.sessions.ttl_secs()
    }

    pub async fn register(&self, form: RegisterForm) -> Result<Session> {
        let username = required(form.username.as_deref(), "missing username")?;
        let password = required(form.password.as_deref(), "missing password")?;
        if form.confirm.as_deref() != Some(password) {
            return Err(AppError::Validation("password mismatch".to_string()));
        }

        let hash = hash_password(password.to_string(), self.bcrypt_cost).await?;
        let user_id = self
            .ledger
            .create_user(username, &hash, self.starting_cash)
            .await
            .map_err(|e| match e {
                AppError::Conflict(_) => AppError::Conflict("username taken :(".to_string()),
                other => other,
            })?;
        info!("Registered user {} ({})", username, user_id);
        self.open_session(user_id).await
    }

    pub async fn login(&self, form: LoginForm) -> Result<Session> {
        let username = required(form.username.as_deref(), "must provide username")?;
        let password = required(form.password.as_deref(), "must provide password")?;

        let user = match self.ledger.find_user(username).await? {
            Some(user) => user,
            None => {
                warn!("Login for unknown user {}", username);
                return Err(AppError::InvalidCredentials);
            }
        };
        if !verify_password(password.to_string(), user.hash.clone()).await? {
            warn!("Wrong password for user {}", username);
            return Err(AppError::InvalidCredentials);
        }
        info!("User {} logged in", username);
        self.open_session(user.id).await
    }

    pub async fn logout(&self, token: Option<&str>) {
        if let Some(token) = token {
            self.sessions.destroy(token).await;
        }
    }

    async fn open_session(&self, user_id: UserId) -> Result<Session> {
        let token = self.sessions.create(user_id).await?;
        Ok(Session {
            token,
            context: Context { user_id },
        })
    }
}

fn required<'a>(value: Option<&'a str>, message: &str) -> Result<&'a str> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::Validation(message.to_string())),
    }
}

// bcrypt blocks the thread for the whole hash, so it runs on the blocking pool.

async fn hash_password(password: String, cost: u32) -> Result<String> {
    task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| AppError::Internal(format!("hashing task failed: {}", e)))?
        .map_err(|e| AppError::Internal(format!("hashing failed: {}", e)))
}

async fn verify_password(password: String, hash: String) -> Result<bool> {
    task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| AppError::Internal(format!("verify task failed: {}", e)))?
        .map_err(|e| AppError::Internal(format!("stored hash unreadable: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn accounts() -> (Accounts, Arc<Ledger>, Arc<SessionStore>) {
        let ledger = Arc::new(Ledger::in_memory().await.unwrap());
        let sessions = Arc::new(SessionStore::new("test-secret", 3600));
        let accounts = Accounts::new(ledger.clone(), sessions.clone(), dec!(10000.00), 4);
        (accounts, ledger, sessions)
    }

    fn register_form(username: &str, password: &str, confirm: &str) -> RegisterForm {
        RegisterForm {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            confirm: Some(confirm.to_string()),
        }
    }

    fn login_form(username: &str, password: &str) -> LoginForm {
        LoginForm {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
        }
    }

    #[tokio::test]
    async fn register_opens_a_session_with_starting_cash() {
        let (accounts, ledger, sessions) = accounts().await;
        let session = accounts
            .register(register_form("bob", "hunter2", "hunter2"))
            .await
            .unwrap();
        assert_eq!(sessions.resolve(&session.token).await, Some(session.context));

        let user = ledger.find_user("bob").await.unwrap().unwrap();
        assert_eq!(user.cash, dec!(10000.00));
        assert_ne!(user.hash, "hunter2");
    }

    #[tokio::test]
    async fn register_validates_fields() {
        let (accounts, _, _) = accounts().await;
        let cases = [
            register_form("", "pw", "pw"),
            register_form("bob", "", ""),
            register_form("bob", "pw", "wp"),
            RegisterForm::default(),
        ];
        for form in cases {
            let err = accounts.register(form).await.unwrap_err();
            assert!(matches!(err, AppError::Validation(_)));
        }
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let (accounts, ledger, _) = accounts().await;
        accounts.register(register_form("bob", "a", "a")).await.unwrap();
        let err = accounts
            .register(register_form("bob", "b", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        // the original credentials still work
        accounts.login(login_form("bob", "a")).await.unwrap();
        assert!(ledger.find_user("bob").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn login_checks_credentials() {
        let (accounts, _, sessions) = accounts().await;
        accounts.register(register_form("carol", "pw", "pw")).await.unwrap();

        let err = accounts.login(login_form("carol", "wrong")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidCredentials));
        // only the registration session exists
        assert_eq!(sessions.active().await, 1);
        let err = accounts.login(login_form("dave", "pw")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidCredentials));
        let err = accounts.login(LoginForm::default()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let session = accounts.login(login_form("carol", "pw")).await.unwrap();
        assert!(sessions.resolve(&session.token).await.is_some());

        accounts.logout(Some(&session.token)).await;
        assert!(sessions.resolve(&session.token).await.is_none());
        accounts.logout(None).await;
    }
}
