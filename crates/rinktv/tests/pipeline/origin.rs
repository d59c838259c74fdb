use std::path::Path;

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use rinktv::{assemble::Concatenator, RinkResult};
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

pub const SESSION_KEY: &str = "secret";

pub const KEYS: [[u8; 16]; 2] = [*b"0123456789abcdef", *b"fedcba9876543210"];
pub const IVS: [u128; 2] = [1, 0xABCDEF00000000000000000000000002];

pub fn plaintext(segment_number: u64) -> Vec<u8> {
    format!("<segment {segment_number}>").into_bytes()
}

fn encrypt(key: &[u8; 16], iv: u128, plain: &[u8]) -> Vec<u8> {
    cbc::Encryptor::<aes::Aes128>::new(key.into(), &iv.to_be_bytes().into())
        .encrypt_padded_vec_mut::<Pkcs7>(plain)
}

/// Origin serving a master manifest, a 3500K playlist with two keys and four
/// encrypted segments. Every route requires the session cookie.
pub struct Origin {
    pub server: MockServer,
}

impl Origin {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let cookie = format!("mediaAuth={SESSION_KEY}");

        let master = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=1800000,RESOLUTION=960x540
1500K/1500_complete.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=4000000,RESOLUTION=1280x720
3500K/3500_complete.m3u8
";
        let playlist = format!(
            "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:10
#EXT-X-KEY:METHOD=AES-128,URI=\"{uri}/keys/1\",IV=0x{iv1:032X}
#EXTINF:5.005,
segment_1.ts
#EXTINF:5.005,
segment_2.ts
#EXT-X-KEY:METHOD=AES-128,URI=\"{uri}/keys/2\",IV=0x{iv2:032X}
#EXTINF:5.005,
segment_3.ts
#EXTINF:5.005,
segment_4.ts
#EXT-X-ENDLIST
",
            uri = server.uri(),
            iv1 = IVS[0],
            iv2 = IVS[1],
        );

        let mut routes: Vec<(String, Vec<u8>)> = vec![
            ("/vod/master_tablet60.m3u8".to_string(), master.into()),
            ("/vod/3500K/3500_complete.m3u8".to_string(), playlist.into()),
            ("/keys/1".to_string(), KEYS[0].to_vec()),
            ("/keys/2".to_string(), KEYS[1].to_vec()),
        ];
        for n in 1..=4u64 {
            let group = if n <= 2 { 0 } else { 1 };
            routes.push((
                format!("/vod/3500K/segment_{n}.ts"),
                encrypt(&KEYS[group], IVS[group], &plaintext(n)),
            ));
        }

        for (route, body) in routes {
            Mock::given(method("GET"))
                .and(path(route))
                .and(header("cookie", cookie.as_str()))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
                .mount(&server)
                .await;
        }

        Self { server }
    }

    pub fn stream_url(&self) -> String {
        format!("{}/vod/master_tablet60.m3u8", self.server.uri())
    }

    /// Answer the next `times` requests for `route` with `status` instead.
    pub async fn fail(&self, route: &str, status: u16, times: u64) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status))
            .up_to_n_times(times)
            .with_priority(1)
            .mount(&self.server)
            .await;
    }
}

pub fn expected_output() -> Vec<u8> {
    (1..=4).flat_map(plaintext).collect()
}

/// Joins the files of a concat list byte for byte, standing in for ffmpeg.
pub struct ByteConcat;

impl Concatenator for ByteConcat {
    async fn concatenate(&self, list_file: &Path, output: &Path) -> RinkResult<()> {
        let dir = list_file.parent().expect("list file has a parent");
        let list = tokio::fs::read_to_string(list_file).await?;
        let mut joined = Vec::new();
        for line in list.lines() {
            let name = line.strip_prefix("file ").expect("concat list line");
            joined.extend(tokio::fs::read(dir.join(name)).await?);
        }
        tokio::fs::write(output, joined).await?;
        Ok(())
    }
}
