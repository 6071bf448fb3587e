//! End-to-end tests of the VAU transport against the mock HSM.

use erp_blob::{BlobCache, BlobEntry, MemoryBlobStore};
use erp_core::{BlobType, ErpError};
use erp_crypto::{EcKeyPair, PublicKey};
use erp_hsm::{
    ClientHsmFactory, HsmFactory, HsmPool, HsmTeeTokenSource, MockAttestor, MockHsmClient,
    PoolConfig, TeeTokenUpdater,
};
use erp_vau::{ClientTeeProtocol, Jwt, ResponseContext, TeeProtocol, MINIMUM_SIZE};
use http::{Method, Request, Response, StatusCode};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct Fixture {
    client: Arc<MockHsmClient>,
    cache: Arc<BlobCache>,
    pool: Arc<HsmPool>,
    protocol: TeeProtocol,
}

fn fixture(provision: bool) -> Fixture {
    let cache = Arc::new(BlobCache::new(Box::new(MemoryBlobStore::new()), "test").unwrap());
    let client = Arc::new(MockHsmClient::new());
    if provision {
        client.provision_blobs(&cache).unwrap();
    }
    let factory: Arc<dyn HsmFactory> =
        Arc::new(ClientHsmFactory::new(client.clone(), Arc::clone(&cache)));
    let updater = TeeTokenUpdater::new(
        Arc::new(HsmTeeTokenSource::new(
            Arc::clone(&factory),
            Arc::new(MockAttestor),
        )),
        Duration::from_secs(60),
        Duration::from_secs(1),
    );
    updater.update().unwrap();
    let pool = Arc::new(HsmPool::new(
        factory,
        updater.subscribe(),
        PoolConfig::default(),
    ));
    Fixture {
        client,
        cache,
        protocol: TeeProtocol::new(Arc::clone(&pool)),
        pool,
    }
}

fn server_key(f: &Fixture) -> PublicKey {
    f.pool.with_session(|s| s.get_ecies_public_key()).unwrap()
}

fn jwt() -> Jwt {
    Jwt::compose(
        &json!({"alg": "BP256R1", "typ": "JWT"}),
        &json!({"professionOID": "1.2.276.0.76.4.30", "idNummer": "3-SMC-B-Testkarte-1"}),
        b"signature",
    )
    .unwrap()
}

fn task_request() -> Request<Vec<u8>> {
    Request::builder()
        .method(Method::POST)
        .uri("/Task/$create")
        .header("Authorization", format!("Bearer {}", jwt().as_str()))
        .header("Content-Type", "application/fhir+json")
        .body(br#"{"resourceType":"Parameters"}"#.to_vec())
        .unwrap()
}

fn ok_response() -> Response<Vec<u8>> {
    Response::builder()
        .status(StatusCode::CREATED)
        .header("Content-Type", "application/fhir+json")
        .body(br#"{"resourceType":"Task"}"#.to_vec())
        .unwrap()
}

#[test]
fn request_and_response_round_trip() {
    let f = fixture(true);
    let mut client = ClientTeeProtocol::new(server_key(&f));
    let wire = client.create_request(&jwt(), task_request()).unwrap();

    let decrypted = f.protocol.decrypt(&wire).unwrap();
    let request = &decrypted.inner.request;
    assert_eq!(request.method(), Method::POST);
    assert_eq!(request.uri().path(), "/Task/$create");
    assert_eq!(request.body(), br#"{"resourceType":"Parameters"}"#);
    assert_eq!(decrypted.inner.bearer_token(), Some(jwt().as_str()));
    assert_eq!(decrypted.inner.jwt.profession_oid(), Some("1.2.276.0.76.4.30"));
    assert_eq!(Some(&decrypted.inner.request_id), client.request_id());
    assert!(decrypted.context.has_response_key());

    let encrypted = f.protocol.encrypt(ok_response(), &decrypted.context).unwrap();
    let response = client.parse_response(&encrypted).unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.body(), br#"{"resourceType":"Task"}"#);
}

#[test]
fn asymmetric_response_without_response_key() {
    let f = fixture(true);
    let mut client = ClientTeeProtocol::new(server_key(&f));
    let wire = client.create_request(&jwt(), task_request()).unwrap();
    let decrypted = f.protocol.decrypt(&wire).unwrap();

    let context = ResponseContext::new(
        *decrypted.context.request_id(),
        None,
        *decrypted.context.client_public_key(),
    );
    let encrypted = f.protocol.encrypt(ok_response(), &context).unwrap();
    assert!(encrypted.len() >= MINIMUM_SIZE);
    assert_eq!(encrypted[0], 1);
    let response = client.parse_response(&encrypted).unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[test]
fn any_flipped_byte_fails_authentication() {
    let f = fixture(true);
    let mut client = ClientTeeProtocol::new(server_key(&f));
    let wire = client.create_request(&jwt(), task_request()).unwrap();

    // iv, ciphertext and tag
    for index in (65..wire.len()).step_by(7).chain([wire.len() - 1]) {
        let mut tampered = wire.clone();
        tampered[index] ^= 0x01;
        assert!(
            matches!(
                f.protocol.decrypt(&tampered),
                Err(ErpError::AuthenticationFailed(_))
            ),
            "byte {index}"
        );
    }

    // a changed ephemeral key either leaves the curve or derives the wrong key
    let mut tampered = wire.clone();
    tampered[10] ^= 0x01;
    assert!(matches!(
        f.protocol.decrypt(&tampered),
        Err(ErpError::AuthenticationFailed(_)) | Err(ErpError::MalformedInput(_))
    ));
}

#[test]
fn every_valid_keypair_is_tried() {
    let f = fixture(true);
    let old_key = server_key(&f);

    let pair = EcKeyPair::generate();
    let blob = f
        .client
        .wrap_for_enrolment(pair.secret_bytes().as_bytes(), 2)
        .unwrap();
    f.cache
        .store_blob(BlobEntry::new(BlobType::EciesKeypair, "ecies-2", blob))
        .unwrap();
    assert_eq!(f.cache.get_ecies_keypairs().unwrap().len(), 2);
    assert_eq!(&server_key(&f), pair.public_key());

    for key in [old_key, *pair.public_key()] {
        let mut client = ClientTeeProtocol::new(key);
        let wire = client.create_request(&jwt(), task_request()).unwrap();
        let decrypted = f.protocol.decrypt(&wire).unwrap();
        let encrypted = f.protocol.encrypt(ok_response(), &decrypted.context).unwrap();
        assert!(client.parse_response(&encrypted).is_ok());
    }
}

#[test]
fn unusable_newer_keypair_does_not_block_older_ones() {
    let f = fixture(true);
    let valid_key = server_key(&f);

    // wraps fine, but is no P-256 private key
    let blob = f.client.wrap_for_enrolment(&[7u8; 48], 2).unwrap();
    f.cache
        .store_blob(BlobEntry::new(BlobType::EciesKeypair, "ecies-broken", blob))
        .unwrap();
    assert_eq!(f.cache.get_ecies_keypairs().unwrap().len(), 2);

    let mut client = ClientTeeProtocol::new(valid_key);
    let wire = client.create_request(&jwt(), task_request()).unwrap();
    let decrypted = f.protocol.decrypt(&wire).unwrap();
    let encrypted = f.protocol.encrypt(ok_response(), &decrypted.context).unwrap();
    assert_eq!(
        client.parse_response(&encrypted).unwrap().status(),
        StatusCode::CREATED
    );
    assert_eq!(f.pool.active_session_count(), 0);

    let mut stranger = ClientTeeProtocol::new(*EcKeyPair::generate().public_key());
    let wire = stranger.create_request(&jwt(), task_request()).unwrap();
    assert!(matches!(
        f.protocol.decrypt(&wire),
        Err(ErpError::AuthenticationFailed(_))
    ));
}

#[test]
fn request_for_an_unknown_key_fails_authentication() {
    let f = fixture(true);
    let mut client = ClientTeeProtocol::new(*EcKeyPair::generate().public_key());
    let wire = client.create_request(&jwt(), task_request()).unwrap();
    assert!(matches!(
        f.protocol.decrypt(&wire),
        Err(ErpError::AuthenticationFailed(_))
    ));
}

#[test]
fn missing_keypair_is_a_configuration_error() {
    let f = fixture(false);
    let mut client = ClientTeeProtocol::new(*EcKeyPair::generate().public_key());
    let wire = client.create_request(&jwt(), task_request()).unwrap();
    assert!(matches!(
        f.protocol.decrypt(&wire),
        Err(ErpError::Configuration(_))
    ));
}

#[test]
fn short_input_is_malformed() {
    let f = fixture(true);
    for wire in [Vec::new(), vec![1u8; MINIMUM_SIZE - 1]] {
        assert!(matches!(
            f.protocol.decrypt(&wire),
            Err(ErpError::MalformedInput(_))
        ));
    }
}

#[test]
fn response_for_another_client_is_rejected() {
    let f = fixture(true);
    let key = server_key(&f);
    let mut first = ClientTeeProtocol::new(key);
    let mut second = ClientTeeProtocol::new(key);
    let wire = first.create_request(&jwt(), task_request()).unwrap();
    second.create_request(&jwt(), task_request()).unwrap();

    let decrypted = f.protocol.decrypt(&wire).unwrap();
    let encrypted = f.protocol.encrypt(ok_response(), &decrypted.context).unwrap();
    assert!(second.parse_response(&encrypted).is_err());
    assert!(first.parse_response(&encrypted).is_ok());
}

#[test]
fn concurrent_requests() {
    let f = fixture(true);
    let key = server_key(&f);
    let protocol = f.protocol.clone();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let protocol = protocol.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    let mut client = ClientTeeProtocol::new(key);
                    let wire = client.create_request(&jwt(), task_request()).unwrap();
                    let decrypted = protocol.decrypt(&wire).unwrap();
                    let encrypted = protocol.encrypt(ok_response(), &decrypted.context).unwrap();
                    assert_eq!(
                        client.parse_response(&encrypted).unwrap().status(),
                        StatusCode::CREATED
                    );
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(f.pool.active_session_count(), 0);
}
