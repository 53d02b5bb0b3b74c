mod util;

use openssl::nid::Nid;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509, X509Crl, X509Req, X509StoreContext};
use time::Duration;

use hsmcert::cert::Certificate;
use hsmcert::cert::params::{CertificateParams, CrlParams, CsrParams, DistinguishedName, RevokedEntry};
use hsmcert::key::KeySpec;
use hsmcert::serial;
use hsmcert::token::KeyRef;

fn to_openssl(cert: &Certificate) -> X509 {
    X509::from_der(&cert.to_der().unwrap()).expect("openssl failed to parse certificate")
}

fn verify_chain(root: &X509, intermediates: &[X509], leaf: &X509) -> Result<(), String> {
    let mut builder = X509StoreBuilder::new().unwrap();
    builder.add_cert(root.clone()).unwrap();
    let store = builder.build();

    let mut chain = Stack::new().unwrap();
    for cert in intermediates {
        chain.push(cert.clone()).unwrap();
    }

    let mut ctx = X509StoreContext::new().unwrap();
    ctx.init(&store, leaf, &chain, |c| {
        Ok(if c.verify_cert()? {
            Ok(())
        } else {
            Err(c.error().error_string().to_string())
        })
    })
    .unwrap()
}

fn common_name(name: &openssl::x509::X509NameRef) -> String {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .unwrap()
        .data()
        .as_utf8()
        .unwrap()
        .to_string()
}

#[test]
fn test_openssl_verifies_self_signed_roots() {
    let (_token, ca) = util::soft_authority();

    for (label, spec) in [
        ("rsa", KeySpec::rsa(2048)),
        ("p256", KeySpec::ec("p-256")),
        ("p384", KeySpec::ec("p-384")),
        ("p521", KeySpec::ec("p-521")),
    ] {
        let (root, _) = util::root_ca(&ca, label, spec);
        let x509 = to_openssl(&root);

        let public_key = x509.public_key().unwrap();
        assert!(x509.verify(&public_key).unwrap(), "{label} root does not verify");
        assert_eq!(x509.version(), 2);
        assert_eq!(common_name(x509.subject_name()), label);
        assert_eq!(
            x509.subject_key_id().unwrap().as_slice(),
            x509.authority_key_id().unwrap().as_slice()
        );
        verify_chain(&x509, &[], &x509).unwrap();
    }
}

#[test]
fn test_openssl_verifies_chain() {
    let (_token, ca) = util::soft_authority();
    let (root, root_issuer) = util::root_ca(&ca, "root", KeySpec::rsa(2048));

    let intermediate_ref = KeyRef::labelled("intermediate");
    let intermediate_key = ca
        .keys()
        .generate(&intermediate_ref, &KeySpec::ec("p-256"))
        .unwrap();
    let intermediate = ca
        .issue_certificate(
            &root_issuer,
            &intermediate_key.public_key,
            &CertificateParams {
                path_len: Some(0),
                ..util::root_params("intermediate", 1825)
            },
            None,
        )
        .unwrap();
    let intermediate_issuer = ca.ca_issuer(intermediate.clone(), &intermediate_ref).unwrap();

    let leaf = ca
        .issue_certificate(
            &intermediate_issuer,
            &util::subject_public_key(),
            &util::server_params("test.example.com", 90),
            None,
        )
        .unwrap();

    let root = to_openssl(&root);
    let intermediate = to_openssl(&intermediate);
    let leaf = to_openssl(&leaf);

    assert_eq!(common_name(leaf.issuer_name()), "intermediate");
    assert_eq!(
        leaf.authority_key_id().unwrap().as_slice(),
        intermediate.subject_key_id().unwrap().as_slice()
    );
    verify_chain(&root, &[intermediate.clone()], &leaf).unwrap();
    verify_chain(&root, &[], &intermediate).unwrap();
    assert!(verify_chain(&root, &[], &leaf).is_err());
}

#[test]
fn test_openssl_verifies_csr() {
    let (_token, ca) = util::soft_authority();
    let key = KeyRef::labelled("csr");
    ca.keys().generate(&key, &KeySpec::rsa(2048)).unwrap();

    let params = CsrParams::builder()
        .subject(
            DistinguishedName::builder()
                .common_name("csr.example.com")
                .country("DE")
                .organization("Example GmbH")
                .build(),
        )
        .dns_names(vec!["csr.example.com".to_string()])
        .build();
    let csr = ca.create_csr(&key, &params, None).unwrap();

    let req = X509Req::from_pem(csr.to_pem().unwrap().as_bytes()).unwrap();
    let public_key = req.public_key().unwrap();
    assert!(req.verify(&public_key).unwrap());
    assert_eq!(common_name(req.subject_name()), "csr.example.com");
    assert_eq!(req.extensions().unwrap().len(), 1);
}

#[test]
fn test_openssl_verifies_crl() {
    let (_token, ca) = util::soft_authority();
    let (root, issuer) = util::root_ca(&ca, "root", KeySpec::ec("p-256"));

    let now = serial::now();
    let params = CrlParams::builder()
        .this_update(now)
        .next_update(now + Duration::days(7))
        .entries(vec![
            RevokedEntry::new(vec![5], now),
            RevokedEntry::new(vec![2], now),
            RevokedEntry::new(vec![9], now),
        ])
        .build();
    let crl = ca.create_crl(&issuer, &params, None).unwrap();

    let x509_crl = X509Crl::from_pem(crl.to_pem().unwrap().as_bytes()).unwrap();
    let root_key = to_openssl(&root).public_key().unwrap();
    assert!(x509_crl.verify(&root_key).unwrap());

    let serials: Vec<String> = x509_crl
        .get_revoked()
        .unwrap()
        .iter()
        .map(|revoked| {
            revoked
                .serial_number()
                .to_bn()
                .unwrap()
                .to_dec_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(serials, vec!["2", "5", "9"]);
}
