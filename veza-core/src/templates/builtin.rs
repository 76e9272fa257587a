//! Embedded template sources.

/// systemd unit for application services.
pub const UNIT_TEMPLATE: &str = r#"[Unit]
Description=Veza {{ name }}
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
WorkingDirectory={{ workdir }}
{% for key, value in env %}Environment="{{ key }}={{ value }}"
{% endfor %}ExecStart={{ exec_start }}
Restart=on-failure
RestartSec=2

[Install]
WantedBy=multi-user.target
"#;

/// HAProxy configuration. Routes arrive ordered longest prefix first.
pub const EDGE_TEMPLATE: &str = r#"# Generated by vezactl. Manual edits are overwritten.
global
    log /dev/log local0
    maxconn 4096

defaults
    mode http
    log global
    option httplog
    option forwardfor
    timeout connect 5s
    timeout client 60s
    timeout server 60s
    timeout tunnel 1h

frontend veza_http
    bind *:{{ bind_port }}
{% for route in routes %}{% if not route.is_default %}    acl is_{{ route.backend }} path_beg {{ route.match_rule }}
    use_backend {{ route.backend }} if is_{{ route.backend }}
{% endif %}{% endfor %}{% if default_backend %}    default_backend {{ default_backend }}
{% endif %}{% for route in routes %}
backend {{ route.backend }}
{% if route.health_path %}    option httpchk GET {{ route.health_path }}
{% endif %}    server {{ route.service }} {{ route.address }}:{{ route.port }} check
{% endfor %}"#;
