//! Signed OAuth `state` values binding an authorisation round trip to the user
//! that started it.

use ring::hmac;

const SEPARATOR: char = '.';

pub struct StateSigner {
    key: hmac::Key,
}

impl StateSigner {
    pub fn new(secret: &str) -> Self {
        StateSigner {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
        }
    }

    /// `<user_id>.<hex HMAC-SHA256 of user_id>`
    pub fn sign(&self, user_id: &str) -> String {
        let tag = hmac::sign(&self.key, user_id.as_bytes());
        format!("{}{}{}", user_id, SEPARATOR, hex::encode(tag.as_ref()))
    }

    /// Returns the user id carried by `state` when its signature checks out.
    pub fn verify(&self, state: &str) -> Option<String> {
        let (user_id, signature) = state.rsplit_once(SEPARATOR)?;
        let signature = hex::decode(signature).ok()?;
        hmac::verify(&self.key, user_id.as_bytes(), &signature).ok()?;
        (!user_id.is_empty()).then(|| user_id.to_string())
    }
}
