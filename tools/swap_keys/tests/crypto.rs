use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::traits::Identity;
use swap_keys::{
    combine_commitments, combine_compressed, commit, derive_joint_spend_key, derive_view_key,
    validate_point, verify_secret_matches_commitment, Commitment, CryptoError, Network, Secret,
};

fn secret(byte: u8) -> Secret {
    Secret::from_bytes([byte; 32]).unwrap()
}

#[test]
fn secret_matches_its_own_commitment_only() {
    let s = Secret::generate().unwrap();
    let other = Secret::generate().unwrap();
    let c = commit(&s);
    assert!(verify_secret_matches_commitment(&s, &c));
    assert!(!verify_secret_matches_commitment(&other, &c));
}

#[test]
fn commitment_is_deterministic() {
    assert_eq!(commit(&secret(3)), commit(&secret(3)));
    assert_ne!(commit(&secret(3)), commit(&secret(4)));
}

#[test]
fn joint_key_is_commutative() {
    let a = commit(&secret(2));
    let b = commit(&secret(9));
    assert_eq!(
        combine_commitments(&a, &b).unwrap(),
        combine_commitments(&b, &a).unwrap()
    );
}

#[test]
fn joint_key_spendable_with_both_secrets() {
    let maker = secret(5);
    let taker = secret(6);
    let joint = combine_commitments(&commit(&maker), &commit(&taker)).unwrap();

    let spend = derive_joint_spend_key(&maker, &taker);
    assert!(joint.is_spendable_by(&spend));
    assert!(!joint.is_spendable_by(&maker));
}

#[test]
fn rejects_identity_commitment() {
    let identity = EdwardsPoint::identity().compress().to_bytes();
    assert!(matches!(
        Commitment::from_compressed(identity),
        Err(CryptoError::SmallOrderPoint)
    ));
    let valid = commit(&secret(1)).to_compressed();
    assert!(combine_compressed(&valid, &identity).is_err());
}

#[test]
fn rejects_invalid_point_encoding() {
    // y = p (2^255 - 19) is non-canonical and must be rejected.
    let mut invalid = [0xffu8; 32];
    invalid[0] = 0xed;
    invalid[31] = 0x7f;
    assert!(validate_point(&invalid).is_err());
}

#[test]
fn rejects_negated_commitment_sum() {
    let a = commit(&secret(8));
    let negated = Commitment::from_compressed((-a.point()).compress().to_bytes()).unwrap();
    assert!(matches!(
        combine_commitments(&a, &negated),
        Err(CryptoError::SmallOrderPoint)
    ));
}

#[test]
fn commitment_serde_validates_points() {
    let c = commit(&secret(4));
    let json = serde_json::to_string(&c).unwrap();
    let back: Commitment = serde_json::from_str(&json).unwrap();
    assert_eq!(back, c);

    let identity = EdwardsPoint::identity().compress().to_bytes();
    let bad = serde_json::to_string(&identity).unwrap();
    assert!(serde_json::from_str::<Commitment>(&bad).is_err());
}

#[test]
fn joint_key_derives_stagenet_address() {
    let maker = secret(10);
    let taker = secret(11);
    let joint = combine_commitments(&commit(&maker), &commit(&taker)).unwrap();
    let spend = derive_joint_spend_key(&maker, &taker);
    let view = derive_view_key(&spend);

    let address = joint.address(Network::Stagenet, &view).unwrap();
    assert_eq!(address.network, Network::Stagenet);
    assert_eq!(address.public_spend.as_bytes(), &joint.to_compressed());
}
