//! Text control commands accepted by the gateway.
//!
//! | Command | Effect |
//! |---|---|
//! | `noop` | Log the application version |
//! | `reset` | Zero translator, socket and command counters |
//! | `status` | Report a [`GatewayStatus`][crate::gateway::GatewayStatus] |
//! | `topics` | List registered topics |
//! | `subscribe <plugin-id> <bus\|external>` | Subscribe a topic |
//! | `unsubscribe <plugin-id> <bus\|external>` | Unsubscribe a topic |
//! | `role <plugin-id> <publish\|subscribe>` | Subscribe according to a network role |
//! | `test start [plugin-id] [param]` | Start the periodic plugin self-test |
//! | `test stop` | Stop the self-test |

use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;
use topicbridge_types::{BridgeError, PluginId, Role, SubscriptionOption};

/// Which side of a topic a subscription command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionTarget {
    Bus,
    External,
}

impl FromStr for SubscriptionTarget {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bus" => Ok(SubscriptionTarget::Bus),
            "external" => Ok(SubscriptionTarget::External),
            other => Err(BridgeError::MalformedInput(format!(
                "unknown subscription target '{other}' (expected bus or external)"
            ))),
        }
    }
}

/// A parsed control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCommand {
    Noop,
    Reset,
    Status,
    Topics,
    Subscribe {
        plugin_id: PluginId,
        target: SubscriptionTarget,
    },
    Unsubscribe {
        plugin_id: PluginId,
        target: SubscriptionTarget,
    },
    Role {
        plugin_id: PluginId,
        role: Role,
    },
    /// `plugin_id` of `None` selects the configured self-test plugin.
    StartTest {
        plugin_id: Option<PluginId>,
        param: i16,
    },
    StopTest,
}

impl GatewayCommand {
    /// The registry transition requested by a subscription command.
    pub fn subscription_option(&self) -> Option<(PluginId, SubscriptionOption)> {
        match *self {
            GatewayCommand::Subscribe { plugin_id, target } => Some((
                plugin_id,
                match target {
                    SubscriptionTarget::Bus => SubscriptionOption::SubscribeBus,
                    SubscriptionTarget::External => SubscriptionOption::SubscribeExternal,
                },
            )),
            GatewayCommand::Unsubscribe { plugin_id, target } => Some((
                plugin_id,
                match target {
                    SubscriptionTarget::Bus => SubscriptionOption::UnsubscribeBus,
                    SubscriptionTarget::External => SubscriptionOption::UnsubscribeExternal,
                },
            )),
            GatewayCommand::Role { plugin_id, role } => Some((plugin_id, role.subscription())),
            _ => None,
        }
    }
}

fn malformed(msg: impl Into<String>) -> BridgeError {
    BridgeError::MalformedInput(msg.into())
}

fn expect_end<'a>(mut rest: impl Iterator<Item = &'a str>, usage: &str) -> Result<(), BridgeError> {
    match rest.next() {
        None => Ok(()),
        Some(extra) => Err(malformed(format!("unexpected argument '{extra}'; usage: {usage}"))),
    }
}

impl FromStr for GatewayCommand {
    type Err = BridgeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| malformed("empty command"))?;

        let command = match verb {
            "noop" => GatewayCommand::Noop,
            "reset" => GatewayCommand::Reset,
            "status" => GatewayCommand::Status,
            "topics" => GatewayCommand::Topics,
            "subscribe" | "unsubscribe" => {
                let usage = "subscribe|unsubscribe <plugin-id> <bus|external>";
                let plugin_id: PluginId = words
                    .next()
                    .ok_or_else(|| malformed(format!("missing plugin id; usage: {usage}")))?
                    .parse()?;
                let target: SubscriptionTarget = words
                    .next()
                    .ok_or_else(|| malformed(format!("missing target; usage: {usage}")))?
                    .parse()?;
                if verb == "subscribe" {
                    GatewayCommand::Subscribe { plugin_id, target }
                } else {
                    GatewayCommand::Unsubscribe { plugin_id, target }
                }
            }
            "role" => {
                let usage = "role <plugin-id> <publish|subscribe>";
                let plugin_id: PluginId = words
                    .next()
                    .ok_or_else(|| malformed(format!("missing plugin id; usage: {usage}")))?
                    .parse()?;
                let role = match words.next() {
                    Some("publish") => Role::Publish,
                    Some("subscribe") => Role::Subscribe,
                    Some(other) => return Err(malformed(format!("unknown role '{other}'; usage: {usage}"))),
                    None => return Err(malformed(format!("missing role; usage: {usage}"))),
                };
                GatewayCommand::Role { plugin_id, role }
            }
            "test" => match words.next() {
                Some("start") => {
                    let plugin_id = words.next().map(str::parse::<PluginId>).transpose()?;
                    let param = words
                        .next()
                        .map(|p| {
                            p.parse::<i16>()
                                .map_err(|e| malformed(format!("invalid test parameter '{p}': {e}")))
                        })
                        .transpose()?
                        .unwrap_or(0);
                    GatewayCommand::StartTest { plugin_id, param }
                }
                Some("stop") => GatewayCommand::StopTest,
                _ => return Err(malformed("usage: test start [plugin-id] [param] | test stop")),
            },
            other => return Err(malformed(format!("unknown command '{other}'"))),
        };
        expect_end(words, verb)?;
        Ok(command)
    }
}

/// Snapshot of the command counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommandStatus {
    pub valid: u32,
    pub invalid: u32,
}

#[derive(Debug, Default)]
pub(crate) struct CommandCounters {
    valid: AtomicU32,
    invalid: AtomicU32,
}

impl CommandCounters {
    pub(crate) fn record(&self, ok: bool) {
        let counter = if ok { &self.valid } else { &self.invalid };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.valid.store(0, Ordering::Relaxed);
        self.invalid.store(0, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CommandStatus {
        CommandStatus {
            valid: self.valid.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<GatewayCommand, BridgeError> {
        line.parse()
    }

    #[test]
    fn simple_verbs() {
        assert_eq!(parse("noop").unwrap(), GatewayCommand::Noop);
        assert_eq!(parse("  reset ").unwrap(), GatewayCommand::Reset);
        assert_eq!(parse("status").unwrap(), GatewayCommand::Status);
        assert_eq!(parse("topics").unwrap(), GatewayCommand::Topics);
        assert_eq!(parse("test stop").unwrap(), GatewayCommand::StopTest);
    }

    #[test]
    fn subscription_commands() {
        let cmd = parse("subscribe 3 bus").unwrap();
        assert_eq!(
            cmd.subscription_option(),
            Some((PluginId(3), SubscriptionOption::SubscribeBus))
        );
        let cmd = parse("unsubscribe 1 external").unwrap();
        assert_eq!(
            cmd.subscription_option(),
            Some((PluginId(1), SubscriptionOption::UnsubscribeExternal))
        );
        let cmd = parse("role 2 subscribe").unwrap();
        assert_eq!(
            cmd.subscription_option(),
            Some((PluginId(2), SubscriptionOption::SubscribeExternal))
        );
        assert_eq!(parse("noop").unwrap().subscription_option(), None);
    }

    #[test]
    fn test_start_defaults() {
        assert_eq!(
            parse("test start").unwrap(),
            GatewayCommand::StartTest {
                plugin_id: None,
                param: 0
            }
        );
        assert_eq!(
            parse("test start 3 -5").unwrap(),
            GatewayCommand::StartTest {
                plugin_id: Some(PluginId(3)),
                param: -5
            }
        );
    }

    #[test]
    fn malformed_commands_are_rejected() {
        for line in [
            "",
            "launch",
            "subscribe",
            "subscribe x bus",
            "subscribe 3 sideways",
            "role 3 lurker",
            "test",
            "test start 1 99999",
            "noop extra",
        ] {
            assert!(
                matches!(parse(line), Err(BridgeError::MalformedInput(_))),
                "'{line}' should be rejected"
            );
        }
    }

    #[test]
    fn counters_track_outcomes() {
        let counters = CommandCounters::default();
        counters.record(true);
        counters.record(true);
        counters.record(false);
        assert_eq!(counters.snapshot(), CommandStatus { valid: 2, invalid: 1 });
        counters.reset();
        assert_eq!(counters.snapshot(), CommandStatus::default());
    }
}
