//! Routing tables: client↔channel bindings and type-route restrictions.
//!
//! Both mappings are stored as forward maps only; inverse views are derived
//! on demand so the two directions can never diverge.

use std::collections::{BTreeSet, HashMap};

use crate::error::{BridgeError, BridgeResult};

/// A message-type route: deliver matching messages to `channel_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRoute {
    /// Target channel for messages of the routed type.
    pub channel_id: String,
    /// When set, a routed message is delivered only to `channel_id` and
    /// suppressed from the client-bound channel path.
    pub consume: bool,
}

/// The relay's two bidirectional mappings.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    /// Forward map: client name → bound channel. One channel per client;
    /// many clients may share a channel.
    client_channel: HashMap<String, String>,
    /// Forward map: type prefix → route. At most one route per prefix and
    /// at most one prefix per channel.
    type_routes: HashMap<String, TypeRoute>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a client to a channel.
    ///
    /// A client holds at most one binding; rebinding requires an explicit
    /// unbind first. A type-restricted channel cannot also take plain
    /// client bindings.
    pub fn bind_client(&mut self, client: &str, channel_id: &str) -> BridgeResult<()> {
        if let Some(bound) = self.client_channel.get(client) {
            return Err(BridgeError::AlreadyBound(format!(
                "{client} is already bound to channel {bound}"
            )));
        }
        if self.restriction_for_channel(channel_id).is_some() {
            return Err(BridgeError::Conflict(format!(
                "channel {channel_id} is restricted to a message type"
            )));
        }
        self.client_channel
            .insert(client.to_string(), channel_id.to_string());
        Ok(())
    }

    /// Remove a client's channel binding.
    pub fn unbind_client(&mut self, client: &str) -> BridgeResult<()> {
        if self.client_channel.remove(client).is_none() {
            return Err(BridgeError::NotFound(format!(
                "{client} is not bound to any channel"
            )));
        }
        Ok(())
    }

    /// Restrict a channel to a single message type.
    ///
    /// Last write wins: an existing route for the same prefix, or a
    /// different prefix already targeting this channel, is replaced. A
    /// channel holding plain client bindings cannot be restricted.
    pub fn bind_restriction(
        &mut self,
        channel_id: &str,
        prefix: &str,
        consume: bool,
    ) -> BridgeResult<()> {
        if self.client_channel.values().any(|ch| ch == channel_id) {
            return Err(BridgeError::Conflict(format!(
                "channel {channel_id} already holds client bindings"
            )));
        }
        self.type_routes.retain(|_, route| route.channel_id != channel_id);
        self.type_routes.insert(
            prefix.to_string(),
            TypeRoute {
                channel_id: channel_id.to_string(),
                consume,
            },
        );
        Ok(())
    }

    /// Remove a channel's type restriction.
    pub fn unbind_restriction(&mut self, channel_id: &str) -> BridgeResult<()> {
        let before = self.type_routes.len();
        self.type_routes.retain(|_, route| route.channel_id != channel_id);
        if self.type_routes.len() == before {
            return Err(BridgeError::NotFound(format!(
                "channel {channel_id} is not type-restricted"
            )));
        }
        Ok(())
    }

    /// Channel bound to a client, if any.
    pub fn channel_for_client(&self, client: &str) -> Option<&str> {
        self.client_channel.get(client).map(String::as_str)
    }

    /// Derived inverse view: all clients bound to a channel.
    pub fn clients_for_channel(&self, channel_id: &str) -> BTreeSet<&str> {
        self.client_channel
            .iter()
            .filter(|(_, ch)| ch.as_str() == channel_id)
            .map(|(client, _)| client.as_str())
            .collect()
    }

    /// Route for a message-type prefix, if any.
    pub fn route_for_type(&self, prefix: &str) -> Option<&TypeRoute> {
        self.type_routes.get(prefix)
    }

    /// Derived inverse view: the restriction targeting a channel.
    pub fn restriction_for_channel(&self, channel_id: &str) -> Option<(&str, bool)> {
        self.type_routes
            .iter()
            .find(|(_, route)| route.channel_id == channel_id)
            .map(|(prefix, route)| (prefix.as_str(), route.consume))
    }

    /// All client bindings, for status views and persistence.
    pub fn client_bindings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.client_channel
            .iter()
            .map(|(client, channel)| (client.as_str(), channel.as_str()))
    }

    /// All type routes, for status views and persistence.
    pub fn type_bindings(&self) -> impl Iterator<Item = (&str, &TypeRoute)> {
        self.type_routes
            .iter()
            .map(|(prefix, route)| (prefix.as_str(), route))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_channel_per_client() {
        let mut routing = RoutingTable::new();
        routing.bind_client("Survival", "100").unwrap();
        assert!(matches!(
            routing.bind_client("Survival", "200"),
            Err(BridgeError::AlreadyBound(_))
        ));
        assert_eq!(routing.channel_for_client("Survival"), Some("100"));
    }

    #[test]
    fn many_clients_share_a_channel() {
        let mut routing = RoutingTable::new();
        routing.bind_client("Survival", "100").unwrap();
        routing.bind_client("Creative", "100").unwrap();
        let clients = routing.clients_for_channel("100");
        assert_eq!(clients, BTreeSet::from(["Creative", "Survival"]));
    }

    #[test]
    fn unbind_requires_a_binding() {
        let mut routing = RoutingTable::new();
        assert!(matches!(
            routing.unbind_client("Survival"),
            Err(BridgeError::NotFound(_))
        ));
        routing.bind_client("Survival", "100").unwrap();
        routing.unbind_client("Survival").unwrap();
        assert_eq!(routing.channel_for_client("Survival"), None);
    }

    #[test]
    fn restricted_channel_rejects_client_bindings() {
        let mut routing = RoutingTable::new();
        routing.bind_restriction("200", "SYS", true).unwrap();
        assert!(matches!(
            routing.bind_client("Survival", "200"),
            Err(BridgeError::Conflict(_))
        ));
    }

    #[test]
    fn client_bound_channel_rejects_restriction() {
        let mut routing = RoutingTable::new();
        routing.bind_client("Survival", "100").unwrap();
        assert!(matches!(
            routing.bind_restriction("100", "SYS", false),
            Err(BridgeError::Conflict(_))
        ));
    }

    #[test]
    fn restriction_last_write_wins() {
        let mut routing = RoutingTable::new();
        routing.bind_restriction("200", "SYS", false).unwrap();
        routing.bind_restriction("200", "ALERT", true).unwrap();
        // The old rule for the channel is gone, both directions stay
        // single-valued.
        assert_eq!(routing.restriction_for_channel("200"), Some(("ALERT", true)));
        assert!(routing.route_for_type("SYS").is_none());

        routing.bind_restriction("300", "ALERT", false).unwrap();
        assert_eq!(routing.route_for_type("ALERT").unwrap().channel_id, "300");
        assert_eq!(routing.restriction_for_channel("200"), None);
    }

    #[test]
    fn unbind_restriction_requires_a_route() {
        let mut routing = RoutingTable::new();
        assert!(matches!(
            routing.unbind_restriction("200"),
            Err(BridgeError::NotFound(_))
        ));
        routing.bind_restriction("200", "SYS", true).unwrap();
        routing.unbind_restriction("200").unwrap();
        assert_eq!(routing.restriction_for_channel("200"), None);
    }
}
