use super::errors::AuthRequestError;
use crate::ctmap::{Families, Family, FlowTuple, TupleFlags};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Notification that a flow has completed mutual authentication.
///
/// A request names exactly one flow by its full 5-tuple. It can be narrowed further
/// by direction and by the source security identity recorded in the entry, but never
/// widened: there is no way to ask for "every flow requiring auth".
///
/// # Example
///
/// ```rust
/// use conntrack_auth::auth::AuthRequest;
/// use conntrack_auth::ctmap::{FlowTuple, TupleFlags, IPPROTO_TCP};
///
/// let flow = FlowTuple {
///     source_addr: "10.0.1.5".parse()?,
///     dest_addr: "10.0.2.9".parse()?,
///     source_port: 51234,
///     dest_port: 8443,
///     protocol: IPPROTO_TCP,
/// };
/// let req = AuthRequest::new(flow)?
///     .with_direction(TupleFlags::OUT)
///     .with_source_identity(16_777_217);
/// assert_eq!(req.flow(), &flow);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawAuthRequest", into = "RawAuthRequest")]
pub struct AuthRequest {
    flow: FlowTuple,
    family: Family,
    direction: Option<TupleFlags>,
    source_identity: Option<u32>,
}

impl AuthRequest {
    /// Creates a request for `flow`.
    ///
    /// # Errors
    ///
    /// Returns an error if the addresses belong to different families or the protocol
    /// number is zero.
    pub fn new(flow: FlowTuple) -> Result<Self, AuthRequestError> {
        let family = flow.family().ok_or(AuthRequestError::MixedFamilies {
            source_addr: flow.source_addr,
            dest_addr: flow.dest_addr,
        })?;
        if flow.protocol == 0 {
            return Err(AuthRequestError::ZeroProtocol);
        }
        Ok(Self {
            flow,
            family,
            direction: None,
            source_identity: None,
        })
    }

    /// Restricts matching to records stored with this direction.
    #[must_use]
    pub const fn with_direction(mut self, direction: TupleFlags) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Restricts matching to records whose source security identity is `identity`.
    #[must_use]
    pub const fn with_source_identity(mut self, identity: u32) -> Self {
        self.source_identity = Some(identity);
        self
    }

    /// The flow to mark as authenticated.
    pub const fn flow(&self) -> &FlowTuple {
        &self.flow
    }

    /// Address family of the flow.
    pub const fn family(&self) -> Family {
        self.family
    }

    /// Tables to search for this request.
    pub const fn families(&self) -> Families {
        Families::only(self.family)
    }

    /// Required direction, if any.
    pub const fn direction(&self) -> Option<TupleFlags> {
        self.direction
    }

    /// Required source security identity, if any.
    pub const fn source_identity(&self) -> Option<u32> {
        self.source_identity
    }
}

impl fmt::Display for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.flow)?;
        if let Some(direction) = self.direction {
            write!(f, " dir={}", direction.bits())?;
        }
        if let Some(identity) = self.source_identity {
            write!(f, " src_id={identity}")?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct RawAuthRequest {
    flow: FlowTuple,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    direction: Option<TupleFlags>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_identity: Option<u32>,
}

impl TryFrom<RawAuthRequest> for AuthRequest {
    type Error = AuthRequestError;

    fn try_from(raw: RawAuthRequest) -> Result<Self, Self::Error> {
        let mut req = Self::new(raw.flow)?;
        req.direction = raw.direction;
        req.source_identity = raw.source_identity;
        Ok(req)
    }
}

impl From<AuthRequest> for RawAuthRequest {
    fn from(req: AuthRequest) -> Self {
        Self {
            flow: req.flow,
            direction: req.direction,
            source_identity: req.source_identity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctmap::IPPROTO_UDP;

    fn udp6() -> FlowTuple {
        FlowTuple {
            source_addr: "fd00::10".parse().unwrap(),
            dest_addr: "fd00::20".parse().unwrap(),
            source_port: 5353,
            dest_port: 53,
            protocol: IPPROTO_UDP,
        }
    }

    #[test]
    fn selects_family_of_flow() {
        let req = AuthRequest::new(udp6()).unwrap();
        assert_eq!(req.family(), Family::Ipv6);
        assert_eq!(req.families(), Families::IPV6);
    }

    #[test]
    fn rejects_mixed_families() {
        let mut flow = udp6();
        flow.source_addr = "10.0.0.1".parse().unwrap();
        assert!(matches!(
            AuthRequest::new(flow),
            Err(AuthRequestError::MixedFamilies { .. })
        ));
    }

    #[test]
    fn rejects_zero_protocol() {
        let mut flow = udp6();
        flow.protocol = 0;
        assert!(matches!(
            AuthRequest::new(flow),
            Err(AuthRequestError::ZeroProtocol)
        ));
    }

    #[test]
    fn deserialization_validates() {
        let json = r#"{"flow":{"source_addr":"10.0.0.1","dest_addr":"fd00::1","source_port":1,"dest_port":2,"protocol":6}}"#;
        assert!(serde_json::from_str::<AuthRequest>(json).is_err());

        let json = r#"{"flow":{"source_addr":"10.0.0.1","dest_addr":"10.0.0.2","source_port":1,"dest_port":2,"protocol":6},"source_identity":42}"#;
        let req: AuthRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.source_identity(), Some(42));
        assert_eq!(req.direction(), None);
        assert_eq!(req.family(), Family::Ipv4);
    }
}
