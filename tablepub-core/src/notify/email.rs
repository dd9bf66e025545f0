//! Success email over SMTP (lettre).

use async_trait::async_trait;
use lettre::AsyncTransport;

use super::Mailer;
use crate::config::EmailConfig;
use crate::dataset::Dataset;
use crate::error::NotifyError;

pub struct SmtpMailer {
    host: String,
    port: u16,
    username: String,
    password: String,
    from_address: String,
}

impl SmtpMailer {
    pub fn new(config: &EmailConfig) -> Self {
        Self {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            username: config.username.clone(),
            password: config.password.clone(),
            from_address: config.from_address.clone(),
        }
    }
}

fn email_error(message: String) -> NotifyError {
    NotifyError::Email { message }
}

/// Subject and body of the success email.
pub(crate) fn success_message(dataset: &Dataset) -> (String, String) {
    let subject = format!("Your dataset \"{}\" is published", dataset.name());
    let mut body = format!(
        "Hi {},\n\nYour dataset \"{}\" has been published.\n\nRepository: {}\n",
        dataset.user.login,
        dataset.name(),
        dataset.github_url()
    );
    if !dataset.restricted() {
        body.push_str(&format!("Public pages: {}\n", dataset.gh_pages_url()));
    }
    (subject, body)
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_success(&self, dataset: &Dataset) -> Result<(), NotifyError> {
        let Some(to) = dataset.user.email.as_deref() else {
            return Err(email_error(format!(
                "user '{}' has no email address",
                dataset.user.login
            )));
        };
        let (subject, body) = success_message(dataset);

        let email = lettre::Message::builder()
            .from(
                self.from_address
                    .parse()
                    .map_err(|e| email_error(format!("Invalid from address: {e}")))?,
            )
            .to(to
                .parse()
                .map_err(|e| email_error(format!("Invalid to address: {e}")))?)
            .subject(subject)
            .body(body)
            .map_err(|e| email_error(format!("Failed to build email: {e}")))?;

        let creds = lettre::transport::smtp::authentication::Credentials::new(
            self.username.clone(),
            self.password.clone(),
        );
        type Transport = lettre::AsyncSmtpTransport<lettre::Tokio1Executor>;
        let mailer = Transport::starttls_relay(&self.host)
            .map_err(|e| email_error(format!("SMTP relay error: {e}")))?
            .port(self.port)
            .credentials(creds)
            .build();

        mailer
            .send(email)
            .await
            .map_err(|e| email_error(format!("SMTP send error: {e}")))?;
        Ok(())
    }
}
