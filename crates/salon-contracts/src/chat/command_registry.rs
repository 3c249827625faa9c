#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const STYLE_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "haircut",
        action: "set_haircut",
    },
    CommandSpec {
        command: "color",
        action: "set_color",
    },
    CommandSpec {
        command: "colour",
        action: "set_color",
    },
    CommandSpec {
        command: "look",
        action: "set_look",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "save",
    action: "save",
}];

pub(crate) const MULTI_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "upload",
    action: "upload",
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "restyle",
        action: "restyle",
    },
    CommandSpec {
        command: "retry",
        action: "retry_base",
    },
    CommandSpec {
        command: "reset",
        action: "reset",
    },
    CommandSpec {
        command: "status",
        action: "status",
    },
    CommandSpec {
        command: "wait",
        action: "wait",
    },
    CommandSpec {
        command: "styles",
        action: "styles",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
];

pub const SESSION_HELP_COMMANDS: &[&str] = &[
    "/upload",
    "/haircut",
    "/color",
    "/look",
    "/restyle",
    "/retry",
    "/status",
    "/wait",
    "/save",
    "/reset",
    "/styles",
    "/help",
    "/quit",
];
