// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Enqueue-and-forget e-mail delivery. The core never blocks on SMTP;
//! failed sends retry with exponential backoff, at most three attempts.

use crate::cli::Options;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Clone)]
pub struct EmailQueue {
    sender: UnboundedSender<OutboundEmail>,
}

impl EmailQueue {
    pub fn spawn(options: &Options) -> Self {
        let (sender, mut receiver) = unbounded_channel::<OutboundEmail>();
        let transport = build_transport(options);
        let from: Option<Mailbox> = options.smtp_from.parse().ok();
        tokio::spawn(async move {
            let Some(from) = from else {
                log::error!("invalid smtp from address; outbound email disabled");
                return;
            };
            while let Some(email) = receiver.recv().await {
                let Ok(to) = email.to.parse::<Mailbox>() else {
                    log::warn!("dropping email with unparseable recipient");
                    continue;
                };
                for attempt in 0..MAX_ATTEMPTS {
                    let message = Message::builder()
                        .from(from.clone())
                        .to(to.clone())
                        .subject(email.subject.clone())
                        .body(email.body.clone());
                    let message = match message {
                        Ok(message) => message,
                        Err(e) => {
                            log::warn!("failed to build email: {e}");
                            break;
                        }
                    };
                    match transport.send(message).await {
                        Ok(_) => break,
                        Err(e) => {
                            log::warn!("email send attempt {} failed: {e}", attempt + 1);
                            if attempt + 1 < MAX_ATTEMPTS {
                                tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt)).await;
                            }
                        }
                    }
                }
            }
        });
        Self { sender }
    }

    /// At-least-once, fire-and-forget.
    pub fn enqueue(&self, email: OutboundEmail) {
        let _ = self.sender.send(email);
    }

    pub fn send_verification_code(&self, to: &str, username: &str, code: &str) {
        self.enqueue(OutboundEmail {
            to: to.to_owned(),
            subject: "cadence account verification".to_owned(),
            body: format!(
                "Hello {username}!\n\n\
                 Please use the following verification code to verify your account:\n\n\
                 {code}\n\n\
                 This verification code will be valid for 10 minutes.\n\
                 Do not share this verification code with anyone. If you did not request \
                 this code, please ignore this email.\n"
            ),
        });
    }
}

fn build_transport(options: &Options) -> AsyncSmtpTransport<Tokio1Executor> {
    let mut builder =
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&options.smtp_host);
    if !options.smtp_username.is_empty() {
        builder = builder.credentials(Credentials::new(
            options.smtp_username.clone(),
            options.smtp_password.clone(),
        ));
    }
    builder.build()
}
