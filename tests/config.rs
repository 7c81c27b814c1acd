use config::{Config, File, FileFormat};
use fluxmux::ClientConfig;

#[test]
fn test_defaults_without_keys() {
    let config = Config::builder().build().unwrap();
    let client = ClientConfig::from_config(&config, "");
    assert_eq!(client, ClientConfig::default());
    assert_eq!(client.receive_buffer_size, 0x10000);
    assert_eq!(client.send_buffer_size, 0x10000);
    assert_eq!(client.buffer_page_size, 4096);
}

#[test]
fn test_namespaced_keys_take_priority() {
    let toml = r#"
        receive_buffer_size = 4096
        poll_capacity = 32

        [usbmux]
        receive_buffer_size = 2048
        buffer_page_size = 0
    "#;
    let config = Config::builder()
        .add_source(File::from_str(toml, FileFormat::Toml))
        .build()
        .unwrap();

    let named = ClientConfig::from_config(&config, "usbmux");
    assert_eq!(named.receive_buffer_size, 2048);
    assert_eq!(named.poll_capacity, 32);
    assert_eq!(named.send_buffer_size, 0x10000);
    // Zero is clamped.
    assert_eq!(named.buffer_page_size, 1);

    let plain = ClientConfig::from_config(&config, "");
    assert_eq!(plain.receive_buffer_size, 4096);
}
