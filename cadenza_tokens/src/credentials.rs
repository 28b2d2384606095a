use cadenza_clock::{Clock, System};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    AccessToken, AccessTokenRef, ClientId, ClientSecret, RefreshToken, RefreshTokenRef, Scopes,
};

/// The default tolerance used when checking whether an access token has expired
pub const DEFAULT_EXPIRY_TOLERANCE: Duration = Duration::seconds(60);

/// The credentials currently held by an authorization manager
///
/// A value of this type is never mutated once it has been published. Managers
/// replace the whole value atomically, so any snapshot obtained from a
/// manager is internally consistent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TokenResponse", into = "TokenResponse")]
pub struct CredentialState {
    access_token: Option<AccessToken>,
    refresh_token: Option<RefreshToken>,
    expiration_date: Option<DateTime<Utc>>,
    scopes: Scopes,
}

impl CredentialState {
    /// Constructs a new set of credentials
    pub fn new(
        access_token: AccessToken,
        refresh_token: Option<RefreshToken>,
        expiration_date: DateTime<Utc>,
        scopes: Scopes,
    ) -> Self {
        Self {
            access_token: Some(access_token),
            refresh_token,
            expiration_date: Some(expiration_date),
            scopes,
        }
    }

    /// The unauthorized state
    #[inline]
    pub fn unauthorized() -> Self {
        Self::default()
    }

    /// Gets the current access token, if authorized
    #[inline]
    pub fn access_token(&self) -> Option<&AccessTokenRef> {
        self.access_token.as_deref()
    }

    /// Gets the current refresh token, if one was issued
    #[inline]
    pub fn refresh_token(&self) -> Option<&RefreshTokenRef> {
        self.refresh_token.as_deref()
    }

    /// Gets the time at which the access token expires
    #[inline]
    pub fn expiration_date(&self) -> Option<DateTime<Utc>> {
        self.expiration_date
    }

    /// Gets the scopes granted to the access token
    #[inline]
    pub fn scopes(&self) -> &Scopes {
        &self.scopes
    }

    /// Whether an access token is held
    #[inline]
    pub fn has_access_token(&self) -> bool {
        self.access_token.is_some()
    }

    /// Whether an access token is held that has been granted every scope in `required`
    pub fn is_authorized_for(&self, required: &Scopes) -> bool {
        self.access_token.is_some() && required.is_subset(&self.scopes)
    }

    /// Whether the access token should be considered expired at `now`
    ///
    /// The token is treated as expired once `expiration_date + tolerance <= now`,
    /// so a negative tolerance expires tokens early. A held token without an
    /// expiration date never expires. Holding no access token at all counts
    /// as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>, tolerance: Duration) -> bool {
        if self.access_token.is_none() {
            return true;
        }

        match self.expiration_date {
            Some(expiration) => expiration
                .checked_add_signed(tolerance)
                .map_or(false, |deadline| deadline <= now),
            None => false,
        }
    }

    /// Whether the access token should be considered expired according to `clock`
    #[inline]
    pub fn is_expired_with_clock<C: Clock + ?Sized>(&self, clock: &C, tolerance: Duration) -> bool {
        self.is_expired_at(clock.now(), tolerance)
    }

    /// Applies a token response obtained by refreshing these credentials
    ///
    /// The refresh token and scopes are only replaced when the response
    /// carries new ones.
    pub(crate) fn refreshed_with(&self, refreshed: CredentialState) -> CredentialState {
        CredentialState {
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token.or_else(|| self.refresh_token.clone()),
            expiration_date: refreshed.expiration_date,
            scopes: if refreshed.scopes.is_empty() {
                self.scopes.clone()
            } else {
                refreshed.scopes
            },
        }
    }

    /// Drops any granted scopes
    pub(crate) fn without_scopes(self) -> CredentialState {
        CredentialState {
            scopes: Scopes::new(),
            ..self
        }
    }

    #[cfg(test)]
    pub(crate) fn with_expiration_date(mut self, expiration_date: Option<DateTime<Utc>>) -> Self {
        self.expiration_date = expiration_date;
        self
    }
}

/// The wire and storage shape of a set of credentials
///
/// Token endpoints report a relative `expires_in`; persisted data carries an
/// absolute `expiration_date`. Both decode through this one type.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub(crate) struct TokenResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<AccessToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<RefreshToken>,
    #[serde(default, skip_serializing)]
    pub expires_in: Option<i64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "timestamp::serialize"
    )]
    pub expiration_date: Option<DateTime<Utc>>,
    #[serde(default, rename = "scope")]
    pub scopes: Scopes,
}

impl TokenResponse {
    /// Resolves the response into credentials, anchoring `expires_in` at `now`
    pub fn into_credentials(self, now: DateTime<Utc>) -> CredentialState {
        let expiration_date = match self.expires_in {
            Some(secs) => Duration::try_seconds(secs).and_then(|d| now.checked_add_signed(d)),
            None => self.expiration_date,
        };

        CredentialState {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expiration_date,
            scopes: self.scopes,
        }
    }
}

impl From<TokenResponse> for CredentialState {
    fn from(dto: TokenResponse) -> Self {
        dto.into_credentials(System.now())
    }
}

impl From<CredentialState> for TokenResponse {
    fn from(state: CredentialState) -> Self {
        Self {
            access_token: state.access_token,
            refresh_token: state.refresh_token,
            expires_in: None,
            expiration_date: state.expiration_date,
            scopes: state.scopes,
        }
    }
}

mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::Serializer;

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(date) => serializer.serialize_str(&date.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => serializer.serialize_none(),
        }
    }
}

/// Authorization information in the layout that host applications persist
///
/// ```json
/// {
///   "client_id": "…",
///   "client_secret": "…",
///   "access_token": "…",
///   "refresh_token": "…",
///   "expiration_date": "2024-01-01T00:00:00Z",
///   "scope": "playlist-read-private user-read-email"
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedAuthorization {
    /// The client ID the credentials were issued to
    pub client_id: ClientId,

    /// The client secret, for flows that use one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<ClientSecret>,

    /// The credentials themselves
    #[serde(flatten)]
    pub credentials: CredentialState,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn example_state() -> CredentialState {
        CredentialState::new(
            AccessToken::from_static("AT1"),
            Some(RefreshToken::from_static("RT1")),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ["playlist-read-private", "user-read-email"].into_iter().collect(),
        )
    }

    mod expiry {
        use super::*;

        #[test]
        fn expiring_exactly_now_with_zero_tolerance_is_expired() {
            let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let state = example_state();
            assert!(state.is_expired_at(now, Duration::zero()));
        }

        #[test]
        fn positive_tolerance_extends_the_lifetime() {
            let expiry = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let state = example_state();

            assert!(!state.is_expired_at(expiry - Duration::seconds(30), DEFAULT_EXPIRY_TOLERANCE));
            assert!(!state.is_expired_at(expiry + Duration::seconds(59), DEFAULT_EXPIRY_TOLERANCE));
            assert!(state.is_expired_at(expiry + Duration::seconds(60), DEFAULT_EXPIRY_TOLERANCE));
        }

        #[test]
        fn negative_tolerance_expires_tokens_early() {
            let expiry = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let state = example_state();

            assert!(!state.is_expired_at(expiry - Duration::seconds(2), Duration::seconds(-1)));
            assert!(state.is_expired_at(expiry - Duration::seconds(1), Duration::seconds(-1)));
        }

        #[test]
        fn missing_expiration_is_not_expired() {
            let state = example_state().with_expiration_date(None);
            assert!(!state.is_expired_at(Utc::now(), DEFAULT_EXPIRY_TOLERANCE));
        }

        #[test]
        fn unauthorized_counts_as_expired() {
            let state = CredentialState::unauthorized();
            assert!(state.is_expired_at(Utc::now(), DEFAULT_EXPIRY_TOLERANCE));
        }
    }

    mod authorization {
        use super::*;

        #[test]
        fn empty_scopes_are_still_authorized() {
            let state = CredentialState::new(
                AccessToken::from_static("AT1"),
                None,
                Utc::now(),
                Scopes::new(),
            );
            assert!(state.is_authorized_for(&Scopes::new()));
            assert!(!state.is_authorized_for(&Scopes::single("user-read-email")));
        }

        #[test]
        fn unauthorized_fails_even_for_no_scopes() {
            assert!(!CredentialState::unauthorized().is_authorized_for(&Scopes::new()));
        }
    }

    mod coding {
        use super::*;

        #[test]
        fn round_trips_through_the_persisted_form() {
            let state = example_state();
            let json = serde_json::to_value(&state).unwrap();

            assert_eq!(json["expiration_date"], "2024-01-01T00:00:00Z");
            assert_eq!(json["scope"], "playlist-read-private user-read-email");

            let decoded: CredentialState = serde_json::from_value(json).unwrap();
            assert_eq!(decoded, state);
        }

        #[test]
        fn expires_in_and_expiration_date_resolve_to_the_same_instant() {
            let now = Utc::now();
            let live: TokenResponse = serde_json::from_str(
                r#"{
                    "access_token": "AT1",
                    "refresh_token": "RT1",
                    "expires_in": 3600,
                    "scope": "playlist-read-private user-read-email"
                }"#,
            )
            .unwrap();
            let live = live.into_credentials(now);

            let persisted = serde_json::to_string(&live).unwrap();
            assert!(!persisted.contains("expires_in"));
            let decoded: CredentialState = serde_json::from_str(&persisted).unwrap();

            let expected = now + Duration::seconds(3600);
            let drift = decoded.expiration_date().unwrap() - expected;
            assert!(drift.num_milliseconds().abs() <= 1000);
            assert_eq!(decoded.access_token(), live.access_token());
            assert_eq!(decoded.refresh_token(), live.refresh_token());
            assert_eq!(decoded.scopes(), live.scopes());
        }

        #[test]
        fn oversized_expires_in_leaves_no_expiration_date() {
            let response = TokenResponse {
                access_token: Some(AccessToken::from_static("AT1")),
                expires_in: Some(i64::MAX),
                ..TokenResponse::default()
            };

            let credentials = response.into_credentials(Utc::now());
            assert_eq!(credentials.expiration_date(), None);
        }

        #[test]
        fn unauthorized_state_decodes_from_empty_object() {
            let decoded: CredentialState = serde_json::from_str("{}").unwrap();
            assert_eq!(decoded, CredentialState::unauthorized());
        }

        #[test]
        fn persisted_authorization_uses_a_flat_layout() {
            let persisted = PersistedAuthorization {
                client_id: ClientId::from_static("client"),
                client_secret: Some(ClientSecret::from_static("secret")),
                credentials: example_state(),
            };

            let json = serde_json::to_value(&persisted).unwrap();
            assert_eq!(json["client_id"], "client");
            assert_eq!(json["client_secret"], "secret");
            assert_eq!(json["access_token"], "AT1");

            let decoded: PersistedAuthorization = serde_json::from_value(json).unwrap();
            assert_eq!(decoded, persisted);
        }
    }
}
