use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::db::{Contact, ContactProfile, DatabaseManager, NewContact};
use crate::tenant::TenantScope;

use super::RoutingError;

/// Canonical E.164-ish form: formatting characters dropped, a leading `+`,
/// and 6 to 15 digits.
pub fn normalize_phone(raw: &str) -> Result<String, RoutingError> {
    let trimmed = raw.trim();
    let digits: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.' | '+'))
        .collect();

    let plus_count = trimmed.matches('+').count();
    let plus_ok = plus_count == 0 || (plus_count == 1 && trimmed.starts_with('+'));
    if !plus_ok || digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(RoutingError::Malformed(format!("invalid phone number {raw:?}")));
    }
    if !(6..=15).contains(&digits.len()) {
        return Err(RoutingError::Malformed(format!(
            "phone number {raw:?} must have 6 to 15 digits"
        )));
    }
    Ok(format!("+{digits}"))
}

/// Display attributes carried by an inbound event.
#[derive(Debug, Clone, Default)]
pub struct ContactAttributes {
    pub name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    /// Merged key by key into the stored metadata when present.
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone)]
pub struct ResolvedContact {
    pub contact: Contact,
    pub created: bool,
}

pub struct ContactResolver {
    db_manager: Arc<DatabaseManager>,
}

impl ContactResolver {
    pub fn new(db_manager: Arc<DatabaseManager>) -> Self {
        Self { db_manager }
    }

    /// Insert-or-fetch on `(company, phone)`, then refresh display fields on
    /// an existing row if the event carries newer ones.
    pub async fn resolve(
        &self,
        scope: &TenantScope,
        phone: &str,
        attributes: &ContactAttributes,
    ) -> Result<ResolvedContact, RoutingError> {
        let phone = normalize_phone(phone)?;
        let store = self.db_manager.contact_store();

        let new_contact = NewContact {
            phone: phone.clone(),
            name: attributes.name.clone(),
            email: attributes.email.clone(),
            avatar_url: attributes.avatar_url.clone(),
            metadata: attributes
                .metadata
                .clone()
                .map_or_else(|| json!({}), Value::Object),
        };
        let (contact, created) = store.insert_or_get_contact(scope, &new_contact).await?;
        scope.ensure_owns("contact", contact.company_id)?;

        if created {
            info!(
                "created contact_id={} company_id={}",
                contact.id,
                scope.company_id()
            );
            return Ok(ResolvedContact { contact, created });
        }

        let Some(profile) = refreshed_profile(&contact, attributes) else {
            return Ok(ResolvedContact { contact, created });
        };
        debug!("refreshing profile of contact_id={}", contact.id);
        let contact = store
            .update_contact_profile(scope, contact.id, &profile)
            .await?;
        Ok(ResolvedContact { contact, created })
    }
}

/// `None` when nothing would change.
fn refreshed_profile(contact: &Contact, attributes: &ContactAttributes) -> Option<ContactProfile> {
    fn pick(current: &Option<String>, incoming: &Option<String>) -> Option<String> {
        match incoming {
            Some(value) if !value.trim().is_empty() => Some(value.clone()),
            _ => current.clone(),
        }
    }

    let metadata = match (&contact.metadata, &attributes.metadata) {
        (_, None) => contact.metadata.clone(),
        (Value::Object(current), Some(incoming)) => {
            let mut merged = current.clone();
            for (key, value) in incoming {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, Some(incoming)) => Value::Object(incoming.clone()),
    };

    let profile = ContactProfile {
        name: pick(&contact.name, &attributes.name),
        email: pick(&contact.email, &attributes.email),
        avatar_url: pick(&contact.avatar_url, &attributes.avatar_url),
        metadata,
    };

    let unchanged = profile.name == contact.name
        && profile.email == contact.email
        && profile.avatar_url == contact.avatar_url
        && profile.metadata == contact.metadata;
    (!unchanged).then_some(profile)
}
