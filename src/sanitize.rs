//! HTML sanitization of email bodies
//!
//! Every body value referenced by an HTML text or html body part is cleaned
//! with a user-generated-content allow list before it leaves the gateway,
//! and the part's `size` is updated to the cleaned byte length.

use std::collections::HashMap;

use thiserror::Error;
use tracing::error;

use crate::jmap::model::{Email, EmailBodyPart};

const SANITIZABLE_MEDIA_TYPES: &[&str] = &["text/html", "text/xhtml"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to parse the media type '{0}'")]
pub struct SanitizeError(pub String);

/// Allow-list HTML cleaner for email bodies
pub struct Sanitizer {
    policy: ammonia::Builder<'static>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sanitizer {
    pub fn new() -> Self {
        let mut policy = ammonia::Builder::default();
        policy.link_rel(Some("nofollow"));
        Self { policy }
    }

    pub fn clean(&self, html: &str) -> String {
        self.policy.clean(html).to_string()
    }

    /// Sanitize the HTML body values of `email`
    ///
    /// Each part id is cleaned once; parts referencing it again only get the
    /// new size.
    ///
    /// # Errors
    ///
    /// A body part with an unparseable media type.
    pub fn sanitize_email(&self, mut email: Email) -> Result<Email, SanitizeError> {
        let mut cleaned: HashMap<String, u64> = HashMap::new();
        let Email {
            html_body,
            text_body,
            body_values,
            ..
        } = &mut email;
        for parts in [html_body, text_body].into_iter().flatten() {
            for part in parts.iter_mut() {
                if !is_sanitizable(part)? {
                    continue;
                }
                let Some(part_id) = part.part_id.as_deref() else {
                    continue;
                };
                if let Some(size) = cleaned.get(part_id) {
                    part.size = Some(*size);
                    continue;
                }
                if let Some(value) = body_values.as_mut().and_then(|v| v.get_mut(part_id)) {
                    value.value = self.clean(&value.value);
                    let size = value.value.len() as u64;
                    cleaned.insert(part_id.to_owned(), size);
                    part.size = Some(size);
                }
            }
        }
        Ok(email)
    }

    /// # Errors
    ///
    /// The first email that fails [`Self::sanitize_email`].
    pub fn sanitize_emails(&self, emails: Vec<Email>) -> Result<Vec<Email>, SanitizeError> {
        emails.into_iter().map(|e| self.sanitize_email(e)).collect()
    }
}

fn is_sanitizable(part: &EmailBodyPart) -> Result<bool, SanitizeError> {
    let Some(media_type) = part.media_type.as_deref() else {
        return Ok(false);
    };
    let parsed: mime::Mime = media_type.parse().map_err(|_| {
        error!(media_type, "failed to parse body part media type");
        SanitizeError(media_type.to_owned())
    })?;
    Ok(SANITIZABLE_MEDIA_TYPES.contains(&parsed.essence_str()))
}
