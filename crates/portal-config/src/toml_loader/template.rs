//! Default TOML config template with inline documentation comments.

/// Generate the default TOML config content with comments.
pub(crate) fn default_config_toml() -> String {
    r##"# Portal relay configuration
# Schema version 1
# Only override what you want to change -- missing fields use defaults.

[server]
# bind = "0.0.0.0"
# port = 8787             # 0 = ephemeral
# ws_path = "/ws"         # must start with '/'
# outbound_queue = 256    # 16-65536 frames per connection

[store]
# backend = "file"        # file, memory
# data_dir = ""           # empty = platform data dir
# write_timeout_ms = 2000 # 50-60000
# retry_backoff_ms = 200  # 0-10000

[logging]
# level = "info"          # trace, debug, info, warn, error
"##
    .to_string()
}
