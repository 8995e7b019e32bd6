//! Cloud-init bootstrap for relay instances
//!
//! The default payload installs tinyproxy with basic auth on the relay port and
//! opens that port in the firewall. A custom template may replace it; the
//! placeholders `{port}`, `{user}` and `{password}` are substituted.

use crate::config::RelayConfig;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

const DEFAULT_TEMPLATE: &str = r#"#cloud-config
package_update: true
packages:
  - tinyproxy
  - ufw
write_files:
  - path: /etc/tinyproxy/tinyproxy.conf
    permissions: "0640"
    content: |
      User tinyproxy
      Group tinyproxy
      Port {port}
      Listen 0.0.0.0
      Timeout 600
      MaxClients 200
      BasicAuth {user} {password}
      DisableViaHeader Yes
      LogLevel Warning
runcmd:
  - ufw allow 22/tcp
  - ufw allow {port}/tcp
  - ufw --force enable
  - systemctl enable tinyproxy
  - systemctl restart tinyproxy
"#;

/// Render the cloud-init document for one relay
pub fn render(config: &RelayConfig, password: &str) -> String {
    let template = config
        .bootstrap_template
        .as_deref()
        .unwrap_or(DEFAULT_TEMPLATE);
    template
        .replace("{port}", &config.relay_port.to_string())
        .replace("{user}", &config.relay_user)
        .replace("{password}", password)
}

/// Render and base64-encode, as the provider expects `user_data`
pub fn user_data(config: &RelayConfig, password: &str) -> String {
    STANDARD.encode(render(config, password))
}
