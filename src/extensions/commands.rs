//! Shared command namespace built from module contributions.

use serde::Serialize;

/// One command or subcommand as registered with the chat platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subcommands: Vec<CommandSpec>,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            usage: None,
            subcommands: Vec::new(),
        }
    }

    pub fn usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = Some(usage.into());
        self
    }

    pub fn subcommand(mut self, command: CommandSpec) -> Self {
        self.subcommands.push(command);
        self
    }
}

/// What a module adds to the command namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandContribution {
    /// A new top-level command (possibly a group with subcommands).
    TopLevel(CommandSpec),
    /// A subcommand added to a named top-level group, created if absent.
    IntoGroup { group: String, command: CommandSpec },
}

/// Why a contribution was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Collision {
    TopLevel { name: String },
    InGroup { group: String, name: String },
}

impl std::fmt::Display for Collision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Collision::TopLevel { name } => write!(f, "top-level command '{name}' already registered"),
            Collision::InGroup { group, name } => {
                write!(f, "command '{name}' already registered in group '{group}'")
            }
        }
    }
}

/// The merged command surface. First registration of a name wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandSurface {
    commands: Vec<CommandSpec>,
}

impl CommandSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[CommandSpec] {
        &self.commands
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// Merge one contribution, refusing it on any name collision.
    pub fn merge(&mut self, contribution: CommandContribution) -> Result<(), Collision> {
        match contribution {
            CommandContribution::TopLevel(command) => {
                if self.get(&command.name).is_some() {
                    return Err(Collision::TopLevel { name: command.name });
                }
                let duplicate = {
                    let mut seen = std::collections::HashSet::new();
                    command
                        .subcommands
                        .iter()
                        .find(|sub| !seen.insert(sub.name.as_str()))
                        .map(|sub| sub.name.clone())
                };
                if let Some(name) = duplicate {
                    return Err(Collision::InGroup {
                        group: command.name,
                        name,
                    });
                }
                self.commands.push(command);
                Ok(())
            }
            CommandContribution::IntoGroup { group, command } => {
                let index = match self.commands.iter().position(|c| c.name == group) {
                    Some(index) => index,
                    None => {
                        self.commands
                            .push(CommandSpec::new(group.clone(), format!("{group} commands")));
                        self.commands.len() - 1
                    }
                };
                let target = &mut self.commands[index];
                if target.subcommands.iter().any(|c| c.name == command.name) {
                    return Err(Collision::InGroup {
                        group,
                        name: command.name,
                    });
                }
                target.subcommands.push(command);
                Ok(())
            }
        }
    }

    /// Merge a module's contributions, logging and dropping collisions.
    pub fn merge_all(
        &mut self,
        module_id: &str,
        contributions: impl IntoIterator<Item = CommandContribution>,
    ) -> usize {
        let mut dropped = 0;
        for contribution in contributions {
            if let Err(collision) = self.merge(contribution) {
                tracing::warn!(
                    extension = %module_id,
                    %collision,
                    "dropping colliding command contribution"
                );
                dropped += 1;
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_top_level_registration_wins() {
        let mut surface = CommandSurface::new();
        surface
            .merge(CommandContribution::TopLevel(CommandSpec::new("roll", "roll dice")))
            .expect("first");
        let collision = surface
            .merge(CommandContribution::TopLevel(CommandSpec::new("roll", "other")))
            .expect_err("duplicate");
        assert_eq!(collision, Collision::TopLevel { name: "roll".into() });
        assert_eq!(surface.commands().len(), 1);
        assert_eq!(surface.commands()[0].description, "roll dice");
    }

    #[test]
    fn group_contributions_merge_and_collide() {
        let mut surface = CommandSurface::new();
        surface
            .merge(CommandContribution::TopLevel(
                CommandSpec::new("chorus", "settings").subcommand(CommandSpec::new("mute", "mute")),
            ))
            .expect("group");

        let dropped = surface.merge_all(
            "factoids",
            [
                CommandContribution::IntoGroup {
                    group: "chorus".into(),
                    command: CommandSpec::new("learn", "learn a factoid"),
                },
                CommandContribution::IntoGroup {
                    group: "chorus".into(),
                    command: CommandSpec::new("mute", "collides"),
                },
            ],
        );

        assert_eq!(dropped, 1);
        let group = surface.get("chorus").expect("group");
        let names: Vec<&str> = group.subcommands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["mute", "learn"]);
        assert_eq!(group.subcommands[0].description, "mute");
    }

    #[test]
    fn missing_group_is_created() {
        let mut surface = CommandSurface::new();
        surface
            .merge(CommandContribution::IntoGroup {
                group: "tools".into(),
                command: CommandSpec::new("ping", "pong"),
            })
            .expect("merge");
        assert_eq!(surface.get("tools").map(|g| g.subcommands.len()), Some(1));
    }
}
